use std::time::Duration;

use retro_common::id::{prefix, prefixed_ulid};

/// Redis URL used when `FANOUT_STRATEGY=redis` is set without `REDIS_URL`.
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// How broadcasts reach connections held by other server instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutStrategy {
    /// Single-process broadcast channel. Cross-instance fan-out is lost.
    Memory,
    /// Redis pub/sub shared by every instance.
    Redis { url: String },
}

impl FanoutStrategy {
    /// `FANOUT_STRATEGY` wins when set; otherwise Redis iff a URL is configured.
    pub fn resolve(strategy: Option<&str>, redis_url: Option<String>) -> Result<Self, String> {
        match strategy.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") => Ok(match redis_url {
                Some(url) => Self::Redis { url },
                None => Self::Memory,
            }),
            Some("memory") => Ok(Self::Memory),
            Some("redis") => Ok(Self::Redis {
                url: redis_url.unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            }),
            Some(other) => Err(format!(
                "FANOUT_STRATEGY must be `memory` or `redis`, got `{other}`"
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
        }
    }
}

/// Sync API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Identifies this process among the instances sharing a fan-out backend.
    pub instance_id: String,
    pub fanout: FanoutStrategy,
    /// Redis pub/sub channel carrying fan-out envelopes.
    pub fanout_channel: String,
    /// Cached snapshots of empty rooms untouched this long are evicted.
    pub snapshot_idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            instance_id: prefixed_ulid(prefix::INSTANCE),
            fanout: FanoutStrategy::Memory,
            fanout_channel: "retro:fanout".to_string(),
            snapshot_idle_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_millis(30_000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if `FANOUT_STRATEGY` is invalid.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let fanout = FanoutStrategy::resolve(
            std::env::var("FANOUT_STRATEGY").ok().as_deref(),
            optional_var("REDIS_URL"),
        )
        .unwrap_or_else(|e| panic!("{e}"));

        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            instance_id: optional_var("INSTANCE_ID").unwrap_or(defaults.instance_id),
            fanout,
            fanout_channel: optional_var("FANOUT_CHANNEL").unwrap_or(defaults.fanout_channel),
            snapshot_idle_ttl: parsed_var("SNAPSHOT_IDLE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.snapshot_idle_ttl),
            sweep_interval: parsed_var("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
