use std::time::Duration;

/// Delay between reconnection attempts. Retries are unlimited.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:4100/ws`.
    pub url: String,
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Load from `SYNC_URL` and `SYNC_RECONNECT_MS`.
    pub fn from_env() -> Self {
        let url = std::env::var("SYNC_URL").unwrap_or_else(|_| "ws://localhost:4100/ws".to_string());
        let reconnect_delay = std::env::var("SYNC_RECONNECT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RECONNECT_DELAY);
        Self {
            url,
            reconnect_delay,
        }
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}
