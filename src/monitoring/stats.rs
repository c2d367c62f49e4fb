//! Execution Statistics
//!
//! Per-model counters and cumulative timings, plus executor-wide totals.
//! All counters are atomics so recording never blocks a pool thread; only
//! creating a model's entry takes the map's write lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::executor::StageTimings;
use crate::registry::ModelId;

/// Live counters for one model
#[derive(Debug, Default)]
pub struct ModelStatistics {
    request_count: AtomicU64,
    cache_hit_count: AtomicU64,
    failure_count: AtomicU64,
    total_inference_nanos: AtomicU64,
    total_processing_nanos: AtomicU64,
    total_execution_nanos: AtomicU64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn avg_ms(total_nanos: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_nanos as f64 / count as f64 / 1_000_000.0
    }
}

impl ModelStatistics {
    /// Record a completed request. Cache hits carry only their total time.
    pub fn record(&self, timings: &StageTimings, from_cache: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if from_cache {
            self.cache_hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_inference_nanos
                .fetch_add(nanos(timings.inference), Ordering::Relaxed);
            self.total_processing_nanos
                .fetch_add(nanos(timings.processing()), Ordering::Relaxed);
        }
        self.total_execution_nanos
            .fetch_add(nanos(timings.total), Ordering::Relaxed);
    }

    /// Record a failed request: one request, one failure, no timing
    pub fn record_failure(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ModelStatsSnapshot {
        let requests = self.request_count();
        let inference = self.total_inference_nanos.load(Ordering::Relaxed);
        let processing = self.total_processing_nanos.load(Ordering::Relaxed);
        let execution = self.total_execution_nanos.load(Ordering::Relaxed);
        ModelStatsSnapshot {
            request_count: requests,
            cache_hit_count: self.cache_hit_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_inference_time_ms: inference as f64 / 1_000_000.0,
            total_processing_time_ms: processing as f64 / 1_000_000.0,
            total_execution_time_ms: execution as f64 / 1_000_000.0,
            avg_inference_time_ms: avg_ms(inference, requests),
            avg_processing_time_ms: avg_ms(processing, requests),
            avg_execution_time_ms: avg_ms(execution, requests),
        }
    }
}

/// Point-in-time view of a model's statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStatsSnapshot {
    pub request_count: u64,
    pub cache_hit_count: u64,
    pub failure_count: u64,
    pub total_inference_time_ms: f64,
    pub total_processing_time_ms: f64,
    pub total_execution_time_ms: f64,
    pub avg_inference_time_ms: f64,
    pub avg_processing_time_ms: f64,
    pub avg_execution_time_ms: f64,
}

/// Executor-wide totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub batched_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    /// cache hits / total requests
    pub cache_hit_rate: f64,
    /// batched requests / total requests
    pub batch_rate: f64,
}

/// All statistics of one executor
#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    models: RwLock<HashMap<ModelId, Arc<ModelStatistics>>>,
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    batched_requests: AtomicU64,
    failed_requests: AtomicU64,
    cancelled_requests: AtomicU64,
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self, id: &ModelId) -> Arc<ModelStatistics> {
        if let Some(stats) = self.models.read().get(id) {
            return stats.clone();
        }
        self.models
            .write()
            .entry(id.clone())
            .or_default()
            .clone()
    }

    pub fn record_completion(&self, id: &ModelId, timings: &StageTimings, from_cache: bool) {
        self.model(id).record(timings, from_cache);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, id: &ModelId) {
        self.model(id).record_failure();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a batch member that completed or failed. Cancelled members are
    /// never counted.
    pub fn record_batched(&self) {
        self.batched_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn model_snapshot(&self, id: &ModelId) -> Option<ModelStatsSnapshot> {
        self.models.read().get(id).map(|stats| stats.snapshot())
    }

    pub fn snapshot(&self) -> HashMap<ModelId, ModelStatsSnapshot> {
        self.models
            .read()
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot()))
            .collect()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let batched = self.batched_requests.load(Ordering::Relaxed);
        let rate = |n: u64| if total > 0 { n as f64 / total as f64 } else { 0.0 };
        ExecutorStats {
            total_requests: total,
            cache_hits: hits,
            batched_requests: batched,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            cache_hit_rate: rate(hits),
            batch_rate: rate(batched),
        }
    }

    /// Drop every per-model entry and zero the totals
    pub fn reset(&self) {
        self.models.write().clear();
        for counter in [
            &self.total_requests,
            &self.cache_hits,
            &self.batched_requests,
            &self.failed_requests,
            &self.cancelled_requests,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings(pre: u64, inf: u64, post: u64, total: u64) -> StageTimings {
        StageTimings {
            preprocess: Duration::from_millis(pre),
            inference: Duration::from_millis(inf),
            postprocess: Duration::from_millis(post),
            total: Duration::from_millis(total),
        }
    }

    #[test]
    fn test_model_averages() {
        let stats = ModelStatistics::default();
        stats.record(&timings(1, 10, 1, 14), false);
        stats.record(&timings(3, 20, 3, 30), false);

        let snap = stats.snapshot();
        assert_eq!(snap.request_count, 2);
        assert!((snap.avg_inference_time_ms - 15.0).abs() < 1e-9);
        assert!((snap.avg_processing_time_ms - 4.0).abs() < 1e-9);
        assert!((snap.avg_execution_time_ms - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hits_skip_inference_time() {
        let stats = ModelStatistics::default();
        stats.record(&timings(1, 10, 1, 12), false);
        stats.record(&timings(0, 0, 0, 2), true);

        let snap = stats.snapshot();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.cache_hit_count, 1);
        assert!((snap.total_inference_time_ms - 10.0).abs() < 1e-9);
        assert!((snap.avg_inference_time_ms - 5.0).abs() < 1e-9);
        assert!((snap.total_execution_time_ms - 14.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_counts_without_timing() {
        let stats = ModelStatistics::default();
        stats.record_failure();
        let snap = stats.snapshot();
        assert_eq!(snap.request_count, 1);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.total_execution_time_ms, 0.0);
    }

    #[test]
    fn test_registry_rates_and_reset() {
        let registry = StatisticsRegistry::new();
        let id = ModelId::from("m1");
        registry.record_completion(&id, &timings(0, 5, 0, 5), false);
        registry.record_completion(&id, &timings(0, 5, 0, 5), false);
        registry.record_completion(&id, &timings(0, 0, 0, 1), true);
        registry.record_completion(&id, &timings(0, 0, 0, 1), true);
        registry.record_batched();
        registry.record_batched();

        let totals = registry.executor_stats();
        assert_eq!(totals.total_requests, 4);
        assert!((totals.cache_hit_rate - 0.5).abs() < 1e-9);
        assert!((totals.batch_rate - 0.5).abs() < 1e-9);
        assert_eq!(registry.model_snapshot(&id).unwrap().request_count, 4);

        registry.reset();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.executor_stats().total_requests, 0);
        assert!(registry.model_snapshot(&id).is_none());
    }
}
