//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`), with sensible defaults for local
//! development.

use std::net::SocketAddr;

use crate::error::GatewayError;

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3000`).
    pub listen_addr: SocketAddr,

    /// Seconds of client silence before a heartbeat probe is sent.
    pub heartbeat_interval_secs: u64,

    /// Seconds of client silence before the connection is evicted.
    /// Must exceed the heartbeat interval so clients get at least one
    /// probe before eviction.
    pub connection_timeout_secs: u64,

    /// Seconds between liveness sweeps.
    pub liveness_sweep_secs: u64,

    /// Messages a connection may receive per rate window.
    pub rate_limit_max_messages: u32,

    /// Length of the rate-limit window in seconds.
    pub rate_limit_window_secs: u64,

    /// Maximum subscriptions a single connection may hold.
    pub max_subscriptions_per_connection: usize,

    /// Capacity of each connection's outbound delivery queue. A full
    /// queue (slow client) is treated as a transport write failure.
    pub outbound_queue_capacity: usize,

    /// Active-connection ceiling above which health reports `warning`.
    pub max_active_connections: usize,

    /// Capacity of the bounded history ring buffers (disconnects,
    /// sent-message timestamps, failed deliveries).
    pub history_capacity: usize,

    /// Seconds between cached statistics refreshes.
    pub stats_refresh_secs: u64,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if `LISTEN_ADDR` is set but
    /// cannot be parsed as a [`SocketAddr`], or if the heartbeat interval
    /// is not smaller than the connection timeout.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string())
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("LISTEN_ADDR: {e}")))?;

        let config = Self {
            listen_addr,
            heartbeat_interval_secs: parse_env("HEARTBEAT_INTERVAL_SECS", 30),
            connection_timeout_secs: parse_env("CONNECTION_TIMEOUT_SECS", 300),
            liveness_sweep_secs: parse_env("LIVENESS_SWEEP_SECS", 10),
            rate_limit_max_messages: parse_env("RATE_LIMIT_MAX_MESSAGES", 100),
            rate_limit_window_secs: parse_env("RATE_LIMIT_WINDOW_SECS", 60),
            max_subscriptions_per_connection: parse_env("MAX_SUBSCRIPTIONS_PER_CONNECTION", 50),
            outbound_queue_capacity: parse_env("OUTBOUND_QUEUE_CAPACITY", 256),
            max_active_connections: parse_env("MAX_ACTIVE_CONNECTIONS", 10_000),
            history_capacity: parse_env("HISTORY_CAPACITY", 1_000),
            stats_refresh_secs: parse_env("STATS_REFRESH_SECS", 5),
        };

        if config.heartbeat_interval_secs >= config.connection_timeout_secs {
            return Err(GatewayError::Configuration(format!(
                "HEARTBEAT_INTERVAL_SECS ({}) must be smaller than CONNECTION_TIMEOUT_SECS ({})",
                config.heartbeat_interval_secs, config.connection_timeout_secs
            )));
        }

        Ok(config)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 300,
            liveness_sweep_secs: 10,
            rate_limit_max_messages: 100,
            rate_limit_window_secs: 60,
            max_subscriptions_per_connection: 50,
            outbound_queue_capacity: 256,
            max_active_connections: 10_000,
            history_capacity: 1_000,
            stats_refresh_secs: 5,
        }
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
