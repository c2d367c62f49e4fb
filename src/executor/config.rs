//! Executor configuration

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::monitoring::PoolSizes;

/// Configuration for [`ModelExecutor`](super::ModelExecutor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Threads running model inference
    pub inference_threads: usize,

    /// Threads running input validation and cache re-checks
    pub preprocess_threads: usize,

    /// Threads converting outputs and delivering results
    pub postprocess_threads: usize,

    /// Maximum number of cached results
    pub max_cache_entries: usize,

    /// Byte budget of the result cache
    pub max_cache_bytes: u64,

    pub enable_batching: bool,

    pub max_batch_size: usize,

    /// Items scanned per band while batching, as a multiple of the free batch slots
    pub batch_scan_factor: usize,

    pub monitoring_interval_ms: u64,

    /// Interval between statistics log lines; 0 disables them
    pub log_stats_interval_ms: u64,

    /// Priorities at or above this go to the high band
    pub high_priority_threshold: i32,

    /// Priorities at or below this go to the low band
    pub low_priority_threshold: i32,

    /// Bound of each band queue
    pub max_queue_size: usize,

    /// How long the dispatcher waits on the high band per iteration
    pub dispatch_poll_ms: u64,

    /// Upper bound on a synchronous call
    pub operation_timeout_ms: u64,

    /// How long shutdown waits for in-flight stage tasks
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            inference_threads: cores.saturating_sub(1).max(1),
            preprocess_threads: 2,
            postprocess_threads: 2,
            max_cache_entries: 100,
            max_cache_bytes: 32 * 1024 * 1024,
            enable_batching: true,
            max_batch_size: 4,
            batch_scan_factor: 2,
            monitoring_interval_ms: 5000,
            log_stats_interval_ms: 60_000,
            high_priority_threshold: 8,
            low_priority_threshold: 2,
            max_queue_size: 1024,
            dispatch_poll_ms: 10,
            operation_timeout_ms: 10_000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `EXECUTOR_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        env_override("EXECUTOR_INFERENCE_THREADS", &mut config.inference_threads);
        env_override("EXECUTOR_PREPROCESS_THREADS", &mut config.preprocess_threads);
        env_override("EXECUTOR_POSTPROCESS_THREADS", &mut config.postprocess_threads);
        env_override("EXECUTOR_MAX_CACHE_ENTRIES", &mut config.max_cache_entries);
        env_override("EXECUTOR_MAX_CACHE_BYTES", &mut config.max_cache_bytes);
        env_override("EXECUTOR_ENABLE_BATCHING", &mut config.enable_batching);
        env_override("EXECUTOR_MAX_BATCH_SIZE", &mut config.max_batch_size);
        env_override("EXECUTOR_BATCH_SCAN_FACTOR", &mut config.batch_scan_factor);
        env_override("EXECUTOR_MONITORING_INTERVAL_MS", &mut config.monitoring_interval_ms);
        env_override("EXECUTOR_LOG_STATS_INTERVAL_MS", &mut config.log_stats_interval_ms);
        env_override("EXECUTOR_HIGH_PRIORITY_THRESHOLD", &mut config.high_priority_threshold);
        env_override("EXECUTOR_LOW_PRIORITY_THRESHOLD", &mut config.low_priority_threshold);
        env_override("EXECUTOR_MAX_QUEUE_SIZE", &mut config.max_queue_size);
        env_override("EXECUTOR_DISPATCH_POLL_MS", &mut config.dispatch_poll_ms);
        env_override("EXECUTOR_OPERATION_TIMEOUT_MS", &mut config.operation_timeout_ms);
        env_override("EXECUTOR_SHUTDOWN_GRACE_MS", &mut config.shutdown_grace_ms);
        config
    }

    /// Load a JSON configuration; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_inference_threads(mut self, n: usize) -> Self {
        self.inference_threads = n;
        self
    }

    pub fn with_preprocess_threads(mut self, n: usize) -> Self {
        self.preprocess_threads = n;
        self
    }

    pub fn with_postprocess_threads(mut self, n: usize) -> Self {
        self.postprocess_threads = n;
        self
    }

    /// Builder method to configure the result cache
    pub fn with_cache(mut self, max_entries: usize, max_bytes: u64) -> Self {
        self.max_cache_entries = max_entries;
        self.max_cache_bytes = max_bytes;
        self
    }

    /// Builder method to enable batching with the given maximum size
    pub fn with_batching(mut self, max_batch_size: usize) -> Self {
        self.enable_batching = true;
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn without_batching(mut self) -> Self {
        self.enable_batching = false;
        self
    }

    pub fn with_batch_scan_factor(mut self, factor: usize) -> Self {
        self.batch_scan_factor = factor;
        self
    }

    pub fn with_monitoring_interval_ms(mut self, ms: u64) -> Self {
        self.monitoring_interval_ms = ms;
        self
    }

    pub fn with_log_stats_interval_ms(mut self, ms: u64) -> Self {
        self.log_stats_interval_ms = ms;
        self
    }

    pub fn with_priority_thresholds(mut self, high: i32, low: i32) -> Self {
        self.high_priority_threshold = high;
        self.low_priority_threshold = low;
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_dispatch_poll_ms(mut self, ms: u64) -> Self {
        self.dispatch_poll_ms = ms;
        self
    }

    pub fn with_operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    pub fn with_shutdown_grace_ms(mut self, ms: u64) -> Self {
        self.shutdown_grace_ms = ms;
        self
    }

    /// Reject configurations the executor cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive_counts = [
            ("inference_threads", self.inference_threads),
            ("preprocess_threads", self.preprocess_threads),
            ("postprocess_threads", self.postprocess_threads),
            ("max_cache_entries", self.max_cache_entries),
            ("max_batch_size", self.max_batch_size),
            ("batch_scan_factor", self.batch_scan_factor),
            ("max_queue_size", self.max_queue_size),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(ExecutorError::invalid_parameter(name, value, "must be positive"));
            }
        }

        let positive_limits = [
            ("max_cache_bytes", self.max_cache_bytes),
            ("monitoring_interval_ms", self.monitoring_interval_ms),
            ("dispatch_poll_ms", self.dispatch_poll_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
        ];
        for (name, value) in positive_limits {
            if value == 0 {
                return Err(ExecutorError::invalid_parameter(name, value, "must be positive"));
            }
        }

        if self.high_priority_threshold <= self.low_priority_threshold {
            return Err(ExecutorError::Config(format!(
                "high_priority_threshold ({}) must be greater than low_priority_threshold ({})",
                self.high_priority_threshold, self.low_priority_threshold
            )));
        }
        Ok(())
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    /// `None` when periodic statistics logging is disabled
    pub fn log_stats_interval(&self) -> Option<Duration> {
        (self.log_stats_interval_ms > 0).then(|| Duration::from_millis(self.log_stats_interval_ms))
    }

    pub fn dispatch_poll(&self) -> Duration {
        Duration::from_millis(self.dispatch_poll_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Thread counts of the stage pools
    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            preprocess: self.preprocess_threads,
            inference: self.inference_threads,
            postprocess: self.postprocess_threads,
        }
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) {
    if let Some(value) = std::env::var(key).ok().and_then(|s| s.parse().ok()) {
        *slot = value;
    }
}
