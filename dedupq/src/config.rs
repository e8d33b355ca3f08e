//! Construction-time configuration.
//!
//! Values are fixed once a component is built; nothing here is reloaded at
//! runtime. Every struct deserializes with serde so embedding applications can
//! carry it in their own config files, and `validate()` rejects capacities
//! that would make a component unusable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default sweep interval for [`crate::TtlCache`].
pub const DEFAULT_SCAN_RATE: Duration = Duration::from_secs(30);

/// Default buffer between the transfer stage and consumers.
pub const DEFAULT_OUTPUT_BUFFER: usize = 8;

/// Default period of the queue's inflight log line.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be at least 1"));
    }
    Ok(())
}

fn require_nonzero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// Options for [`crate::TtlCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// How often the sweeper scans for expired entries.
    pub scan_rate: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            scan_rate: DEFAULT_SCAN_RATE,
        }
    }
}

impl CacheOptions {
    pub fn with_scan_rate(mut self, scan_rate: Duration) -> Self {
        self.scan_rate = scan_rate;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("scan_rate", self.scan_rate)
    }
}

/// Capacities and timings for a [`crate::UniQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Used in log lines only.
    pub name: String,
    /// Max distinct live keys in the dedup window.
    pub max_dedup: usize,
    /// Max items accepted but not yet past the transfer stage.
    pub max_inflight: usize,
    /// How long an admitted key stays deduplicated. Also the sweep period.
    pub dedup_window: Duration,
    /// Slack between the transfer stage and the consumers.
    pub output_buffer: usize,
    /// Period of the "records inflight" log line.
    pub log_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "uniqueue".to_string(),
            max_dedup: 1024,
            max_inflight: 128,
            dedup_window: Duration::from_secs(60),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }
}

impl QueueConfig {
    pub fn new(max_dedup: usize, max_inflight: usize, dedup_window: Duration) -> Self {
        Self {
            max_dedup,
            max_inflight,
            dedup_window,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_output_buffer(mut self, output_buffer: usize) -> Self {
        self.output_buffer = output_buffer;
        self
    }

    pub fn with_log_interval(mut self, log_interval: Duration) -> Self {
        self.log_interval = log_interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("max_dedup", self.max_dedup)?;
        require_positive("max_inflight", self.max_inflight)?;
        require_positive("output_buffer", self.output_buffer)?;
        require_nonzero("dedup_window", self.dedup_window)?;
        require_nonzero("log_interval", self.log_interval)
    }
}

/// Bounds for a [`crate::RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_parallel: usize,
    pub max_per_second: usize,
}

impl RateLimitConfig {
    pub fn new(max_parallel: usize, max_per_second: usize) -> Self {
        Self {
            max_parallel,
            max_per_second,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("max_parallel", self.max_parallel)?;
        require_positive("max_per_second", self.max_per_second)
    }
}

/// A worker pool plus the queue that feeds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue: QueueConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: QueueConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize, queue: QueueConfig) -> Self {
        Self { workers, queue }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("workers", self.workers)?;
        self.queue.validate()
    }
}
