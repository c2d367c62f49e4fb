//! State shared by the facade, the dispatcher, the monitor and stage tasks

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::config::ExecutorConfig;
use super::pool::{InFlight, Stage, WorkerPools};
use super::request::{InferenceRequest, RequestId, RequestState};
use crate::batch::{BandQueues, BatchingOptimizer};
use crate::cache::ResultCache;
use crate::monitoring::{LoadSnapshot, PoolSizingPolicy, StatisticsRegistry, SystemSampler};
use crate::registry::ModelRegistry;

pub(crate) struct ExecutorCore {
    pub(crate) config: RwLock<ExecutorConfig>,
    pub(crate) registry: ModelRegistry,
    pub(crate) cache: ResultCache,
    pub(crate) stats: StatisticsRegistry,
    pub(crate) queues: BandQueues<InferenceRequest>,
    pub(crate) optimizer: BatchingOptimizer<InferenceRequest>,
    pub(crate) in_flight: Arc<InFlight>,
    pools: RwLock<Arc<WorkerPools>>,
    /// Async requests that can still be cancelled
    active: Mutex<HashMap<RequestId, Arc<RequestState>>>,
}

impl ExecutorCore {
    pub(crate) fn new(
        config: ExecutorConfig,
        registry: ModelRegistry,
        cache: ResultCache,
        optimizer: BatchingOptimizer<InferenceRequest>,
        pools: WorkerPools,
    ) -> Self {
        let queues = BandQueues::new(config.max_queue_size);
        Self {
            config: RwLock::new(config),
            registry,
            cache,
            stats: StatisticsRegistry::new(),
            queues,
            optimizer,
            in_flight: Arc::new(InFlight::new()),
            pools: RwLock::new(Arc::new(pools)),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn pools(&self) -> Arc<WorkerPools> {
        self.pools.read().clone()
    }

    /// Replace the worker pools. Tasks already spawned finish on the old ones.
    pub(crate) fn swap_pools(&self, pools: Arc<WorkerPools>) {
        *self.pools.write() = pools;
    }

    pub(crate) fn spawn<F>(&self, stage: Stage, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pools().spawn(stage, &self.in_flight, task);
    }

    pub(crate) fn track(&self, id: RequestId, state: Arc<RequestState>) {
        self.active.lock().insert(id, state);
    }

    pub(crate) fn forget(&self, id: &RequestId) {
        self.active.lock().remove(id);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel a tracked request. False if unknown or already terminal.
    pub(crate) fn cancel(&self, id: &RequestId) -> bool {
        let mut active = self.active.lock();
        let cancelled = match active.get(id) {
            Some(state) => state.cancel(),
            None => false,
        };
        if cancelled {
            active.remove(id);
            self.stats.record_cancellation();
        }
        cancelled
    }
}

/// Per-thread state of the resource monitor
pub(crate) struct MonitorState {
    sampler: SystemSampler,
    last_stats_log: Instant,
}

impl MonitorState {
    pub(crate) fn new() -> Self {
        Self {
            sampler: SystemSampler::new(),
            last_stats_log: Instant::now(),
        }
    }
}

/// One resource monitor tick: sample load, apply the sizing policy, log stats
pub(crate) fn monitor_tick(core: &ExecutorCore, policy: &dyn PoolSizingPolicy, state: &mut MonitorState) {
    let (cpu_usage_pct, memory_usage_pct) = state.sampler.sample();

    // Config stays read-locked until any pool swap is done
    let config = core.config.read();
    let current = core.pools().sizes();
    let load = LoadSnapshot {
        queue_depths: core.queues.depths(),
        in_flight_tasks: core.in_flight.current(),
        active_requests: core.active_count(),
        current,
        configured: config.pool_sizes(),
        cpu_usage_pct,
        memory_usage_pct,
    };

    if let Some(sizes) = policy.resize(&load) {
        let valid = sizes.preprocess > 0 && sizes.inference > 0 && sizes.postprocess > 0;
        if valid && sizes != current {
            match WorkerPools::new(sizes) {
                Ok(pools) => {
                    core.swap_pools(Arc::new(pools));
                    info!(
                        preprocess = sizes.preprocess,
                        inference = sizes.inference,
                        postprocess = sizes.postprocess,
                        queued = load.queue_depths.total(),
                        "Resized worker pools"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to resize worker pools"),
            }
        }
    }

    if let Some(every) = config.log_stats_interval() {
        if state.last_stats_log.elapsed() >= every {
            state.last_stats_log = Instant::now();
            let totals = core.stats.executor_stats();
            let cache = core.cache.stats();
            info!(
                total_requests = totals.total_requests,
                cache_hit_rate = totals.cache_hit_rate,
                batch_rate = totals.batch_rate,
                failed = totals.failed_requests,
                cancelled = totals.cancelled_requests,
                cache_entries = cache.entries,
                cache_bytes = cache.total_bytes,
                queued = load.queue_depths.total(),
                cpu_usage_pct,
                memory_usage_pct,
                "Executor statistics"
            );
        }
    }
}
