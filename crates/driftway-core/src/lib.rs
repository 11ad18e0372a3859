//! Driftway Core - Shared types, configuration, and crypto helpers
//!
//! This crate contains the foundational types used by the Driftway signaling
//! server. It has no dependencies on networking code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod types;

pub use config::{AuditConfig, AuthConfig, Config, ConfigError, RateLimitConfig, SignalConfig};
pub use error::*;
pub use types::*;

/// Default signaling port
pub const DEFAULT_PORT: u16 = 3441;

/// Interval between keep-alive probes in milliseconds
pub const KEEPALIVE_INTERVAL_MS: u64 = 1000;

/// Probes a peer may leave unanswered before it is evicted
pub const KEEPALIVE_MAX_MISSED: u32 = 5;

/// Sliding window for join attempts with guessable codes (seconds)
pub const JOIN_RATE_WINDOW_SECS: u64 = 10;

/// Join attempts allowed inside the window
pub const JOIN_RATE_MAX_ATTEMPTS: usize = 5;
