//! Configuration for the API process.
//!
//! Every knob has a documented default and an environment override; `from_env`
//! never fails, it falls back to the default for anything unset or
//! unparsable.

use std::time::Duration;

use cmp_events::Compression;
use serde::{Deserialize, Serialize};

/// Top-level configuration assembled at startup.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub bus: BusConfig,
    pub sse: SseConfig,
    pub batch: BatchConfig,
    /// Redis URL; `None` runs the multiplexer live-only
    pub redis_url: Option<String>,
    /// Postgres URL for the outbox; `None` disables the worker
    pub database_url: Option<String>,
}

/// Bus transport and frame compression settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub compression: Compression,
    /// Frames strictly larger than this are compressed
    pub compression_threshold: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            compression: Compression::None,
            compression_threshold: 1024,
        }
    }
}

/// SSE delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Comment written on this interval to keep intermediaries alive
    pub heartbeat_interval: Duration,
    /// Connections idle past this are closed by the sweep
    pub idle_timeout: Duration,
    /// Sweep cadence for idle and cancelled connections
    pub cleanup_interval: Duration,
    /// Client reconnect delay set by the initial `retry:` directive
    pub retry_ms: u64,
    /// Per-connection frame channel capacity
    pub channel_capacity: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            retry_ms: 3000,
            channel_capacity: 256,
        }
    }
}

/// Optional delivery batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Events buffered before a forced flush
    pub max_size: usize,
    /// Flush cadence while the buffer is non-empty
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 10,
            flush_interval: Duration::from_millis(100),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl AppConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BUS_URL") {
            config.bus.url = url;
        }
        if let Some(compression) = env_parse("BUS_COMPRESSION") {
            config.bus.compression = compression;
        }
        if let Some(threshold) = env_parse("BUS_COMPRESSION_THRESHOLD") {
            config.bus.compression_threshold = threshold;
        }

        if let Some(secs) = env_parse("SSE_HEARTBEAT_INTERVAL_SECS") {
            config.sse.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SSE_IDLE_TIMEOUT_SECS") {
            config.sse.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("SSE_CLEANUP_INTERVAL_SECS") {
            config.sse.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("SSE_RETRY_MS") {
            config.sse.retry_ms = ms;
        }
        if let Some(capacity) = env_parse("SSE_CHANNEL_CAPACITY") {
            config.sse.channel_capacity = capacity;
        }

        if let Some(enabled) = env_parse::<bool>("SSE_BATCH_ENABLED") {
            config.batch.enabled = enabled;
        }
        if let Some(size) = env_parse("SSE_BATCH_MAX_SIZE") {
            config.batch.max_size = size;
        }
        if let Some(ms) = env_parse("SSE_BATCH_FLUSH_INTERVAL_MS") {
            config.batch.flush_interval = Duration::from_millis(ms);
        }

        config.redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());
        config.database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        config
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), String> {
        if self.sse.heartbeat_interval.is_zero() {
            return Err("heartbeat interval must be greater than zero".to_string());
        }
        if self.sse.idle_timeout < self.sse.heartbeat_interval {
            return Err("idle timeout must be at least one heartbeat interval".to_string());
        }
        if self.sse.channel_capacity == 0 {
            return Err("channel capacity must be greater than zero".to_string());
        }
        if self.batch.enabled && self.batch.max_size == 0 {
            return Err("batch max size must be greater than zero when batching".to_string());
        }
        Ok(())
    }
}
