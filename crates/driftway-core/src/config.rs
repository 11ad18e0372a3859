//! Configuration system for Driftway
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/driftway/config.toml
//! - Linux: ~/.config/driftway/config.toml
//! - Windows: %APPDATA%/driftway/config.toml

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{GroupId, UserId};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling server settings
    pub signal: SignalConfig,
    /// Join attempt rate limiting
    pub rate_limit: RateLimitConfig,
    /// Token verification
    pub auth: AuthConfig,
    /// Audit trail of room joins
    pub audit: AuditConfig,
    /// Static group table: user id -> group ids
    pub groups: HashMap<String, Vec<GroupId>>,
}

/// Signaling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signaling port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Relay transfer payloads through the server when WebRTC is unavailable
    pub ws_fallback: bool,
    /// Group IPv6 clients by their /64 prefix instead of the full address
    pub ipv6_localize: bool,
    /// Verbose logging
    pub debug_mode: bool,
    /// RTCPeerConnection configuration handed to clients in `ws-config`
    pub rtc_config: serde_json::Value,
    /// Keep-alive probe interval in milliseconds
    pub keepalive_interval_ms: u64,
    /// Unanswered probes tolerated before a peer is evicted
    pub keepalive_max_missed: u32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ws_fallback: false,
            ipv6_localize: false,
            debug_mode: false,
            rtc_config: default_rtc_config(),
            keepalive_interval_ms: crate::KEEPALIVE_INTERVAL_MS,
            keepalive_max_missed: crate::KEEPALIVE_MAX_MISSED,
        }
    }
}

impl SignalConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

fn default_rtc_config() -> serde_json::Value {
    serde_json::json!({
        "sdpSemantics": "unified-plan",
        "iceServers": [{ "urls": "stun:stun.l.google.com:19302" }]
    })
}

/// Rate limit applied to joins with guessable codes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sliding window in seconds
    pub window_secs: u64,
    /// Attempts allowed inside the window
    pub max_attempts: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: crate::JOIN_RATE_WINDOW_SECS,
            max_attempts: crate::JOIN_RATE_MAX_ATTEMPTS,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret used to verify bearer tokens
    pub jwt_secret: String,
    /// Cookie carrying the bearer token
    pub token_cookie: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_cookie: "authdrop_token".into(),
        }
    }
}

/// Audit trail configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// SQLite database path (None = events are only logged)
    pub db_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "driftway", "driftway")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Replace the RTC configuration with a JSON document
    ///
    /// Invalid JSON is logged and ignored, keeping the previous value.
    pub fn apply_rtc_config_json(&mut self, json: &str) {
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(value) => self.signal.rtc_config = value,
            Err(e) => warn!("RTC_CONFIG is not valid JSON, ignoring it: {}", e),
        }
    }

    /// Group ids configured for a user
    pub fn groups_for(&self, user_id: UserId) -> HashSet<GroupId> {
        self.groups
            .get(&user_id.to_string())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
}
