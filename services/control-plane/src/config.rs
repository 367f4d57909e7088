//! Configuration for the control plane.

use std::net::SocketAddr;

use anyhow::Result;

use crate::db::DbConfig;

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for HTTP connections.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Whether we're in development mode (runs migrations on startup).
    pub dev_mode: bool,

    /// Database connection settings.
    pub database: DbConfig,

    /// Bearer token accepted for admin API routes.
    ///
    /// A single shared secret is deliberately simple: the admin surface is
    /// operated by the fleet owner, not end users, and SPEC_FULL.md's
    /// Non-goals exclude building a full operator IdP integration.
    pub admin_token: String,

    /// How often the offline sweep marks nodes as unreachable.
    pub offline_sweep_interval: std::time::Duration,

    /// How long a node may go without a heartbeat before it's marked
    /// offline.
    pub heartbeat_timeout: std::time::Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("GLUON_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()?;

        let log_level = std::env::var("GLUON_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("GLUON_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let admin_token = std::env::var("GLUON_ADMIN_TOKEN")
            .map_err(|_| anyhow::anyhow!("GLUON_ADMIN_TOKEN must be set"))?;

        let offline_sweep_interval = std::time::Duration::from_secs(
            std::env::var("GLUON_OFFLINE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        );

        let heartbeat_timeout = std::time::Duration::from_secs(
            std::env::var("GLUON_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(90),
        );

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: DbConfig::from_env(),
            admin_token,
            offline_sweep_interval,
            heartbeat_timeout,
        })
    }
}
