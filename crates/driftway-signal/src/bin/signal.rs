//! Driftway Signal Server
//!
//! WebSocket signaling server for peer discovery, device pairing and relay.
//!
//! # Usage
//!
//! ```bash
//! # Audit events only logged (default)
//! JWT_SECRET=... driftway-signal --port 3441
//!
//! # With the SQLite audit trail and websocket fallback
//! JWT_SECRET=... driftway-signal --db /var/lib/driftway/audit.db --ws-fallback
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftway_core::Config;
use driftway_signal::{
    AuditSink, AuditStore, JwtIdentityResolver, SignalServer, SqliteAuditSink,
    StaticGroupResolver, TracingAuditSink,
};

#[derive(Parser, Debug)]
#[command(name = "driftway-signal")]
#[command(about = "Driftway signaling server for peer discovery and pairing")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database for the audit trail (audit events are only logged if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Relay transfer payloads when peers cannot connect directly
    #[arg(long, env = "WS_FALLBACK")]
    ws_fallback: bool,

    /// Group IPv6 clients by /64 prefix
    #[arg(long, env = "IPV6_LOCALIZE")]
    ipv6_localize: bool,

    /// Verbose logging
    #[arg(long, env = "DEBUG_MODE")]
    debug_mode: bool,

    /// RTCPeerConnection configuration as JSON
    #[arg(long, env = "RTC_CONFIG")]
    rtc_config: Option<String>,

    /// Secret used to verify bearer tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log as JSON
    #[arg(long)]
    log_json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print a sample config file and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Apply command line overrides on top of the config file
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.signal.port = port;
        }
        if let Some(bind) = self.bind {
            config.signal.bind = bind;
        }
        if let Some(db) = &self.db {
            config.audit.db_path = Some(db.clone());
        }
        config.signal.ws_fallback |= self.ws_fallback;
        config.signal.ipv6_localize |= self.ipv6_localize;
        config.signal.debug_mode |= self.debug_mode;
        if let Some(json) = &self.rtc_config {
            config.apply_rtc_config_json(json);
        }
        if let Some(secret) = &self.jwt_secret {
            config.auth.jwt_secret = secret.clone();
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn audit_sink(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    let Some(db_path) = &config.audit.db_path else {
        info!("Audit events are logged only (no database)");
        return Ok(Arc::new(TracingAuditSink));
    };

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = AuditStore::open(db_path)
        .with_context(|| format!("failed to open audit database {:?}", db_path))?;
    info!(
        "Using SQLite audit trail: {:?} ({} records)",
        db_path,
        store.count().unwrap_or(0)
    );

    Ok(Arc::new(SqliteAuditSink::new(Arc::new(store))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config_path = args.config.clone().or_else(Config::default_path);
    let mut config = match &config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);

    init_logging(args.verbose || config.signal.debug_mode, args.log_json);

    if config.auth.jwt_secret.is_empty() {
        bail!("no token secret configured: set JWT_SECRET or [auth] jwt_secret");
    }

    info!("Starting Driftway Signal Server");
    if let Some(path) = &config_path {
        info!("Config file: {:?}", path);
    }
    info!(
        "Websocket fallback {}",
        if config.signal.ws_fallback { "enabled" } else { "disabled" }
    );

    let server = SignalServer::new(
        config.clone(),
        Arc::new(JwtIdentityResolver::new(&config.auth.jwt_secret)),
        Arc::new(StaticGroupResolver::new(config.clone())),
        audit_sink(&config)?,
    );

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
