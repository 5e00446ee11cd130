//! Client configuration.

use std::time::Duration;

/// Configuration shared by [`BridgeClient`](super::BridgeClient) and
/// [`HostClient`](super::HostClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a control-plane request waits for its response
    pub request_timeout_ms: u64,
    /// Interval between `store.heartbeat` messages sent by a host
    pub heartbeat_interval_secs: u64,
    /// Connection attempts after the first one fails
    pub max_retries: u32,
    /// Base delay of the exponential connect backoff
    pub retry_delay_ms: u64,
    /// Notifications buffered before newer ones are dropped
    pub notification_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            max_retries: 3,
            retry_delay_ms: 200,
            notification_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Heartbeat interval as a `Duration`; `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}
