//! Gateway configuration.

use crate::error::{BridgeError, Result};
use crate::protocol::constants::DEFAULT_WS_PATH;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

/// Gateway configuration.
///
/// Defaults suit a local development gateway. [`GatewayConfig::from_env`]
/// overlays `STORE_BRIDGE_*` environment variables on top of them.
///
/// # Examples
///
/// ```ignore
/// use store_bridge::GatewayConfig;
///
/// let config = GatewayConfig {
///     forward_timeout_ms: 2_000,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Path of the WebSocket endpoint
    pub ws_path: String,
    /// How long a forwarded mutation may wait for the host
    pub forward_timeout_ms: u64,
    /// Interval of gateway-to-host `client.ping`; 0 disables it
    pub ping_interval_secs: u64,
    /// Outbound frames buffered per connection before notifications are dropped
    pub outbound_buffer: usize,
    /// Stores a single connection may subscribe to
    pub max_subscriptions: usize,
    /// Mount the REST facade under `/api/bridge`
    pub enable_rest: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            ws_path: DEFAULT_WS_PATH.to_string(),
            forward_timeout_ms: 5_000,
            ping_interval_secs: 30,
            outbound_buffer: 256,
            max_subscriptions: 64,
            enable_rest: true,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `STORE_BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            bind_addr: env_parse("STORE_BRIDGE_BIND", defaults.bind_addr)?,
            ws_path: env::var("STORE_BRIDGE_WS_PATH").unwrap_or(defaults.ws_path),
            forward_timeout_ms: env_parse("STORE_BRIDGE_FORWARD_TIMEOUT_MS", defaults.forward_timeout_ms)?,
            ping_interval_secs: env_parse("STORE_BRIDGE_PING_INTERVAL_SECS", defaults.ping_interval_secs)?,
            outbound_buffer: env_parse("STORE_BRIDGE_OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            max_subscriptions: env_parse("STORE_BRIDGE_MAX_SUBSCRIPTIONS", defaults.max_subscriptions)?,
            enable_rest: env_parse("STORE_BRIDGE_ENABLE_REST", defaults.enable_rest)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.ws_path.starts_with('/') {
            return Err(BridgeError::Config(format!(
                "ws_path must start with '/', got '{}'",
                self.ws_path
            )));
        }
        if self.forward_timeout_ms == 0 {
            return Err(BridgeError::Config("forward_timeout_ms must be positive".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(BridgeError::Config("outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    /// Forward timeout as a `Duration`.
    #[inline]
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    /// Ping interval, or `None` when pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BridgeError::Config(format!("{}='{}': {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}
