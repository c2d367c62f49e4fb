//! Model Executor
//!
//! The public entry point. Callers load models, then submit inference
//! requests synchronously or with a callback. Requests flow through
//!
//! ```text
//! cache lookup -> priority band -> dispatcher -> batching
//!     -> preprocess pool -> inference pool -> postprocess pool -> caller
//! ```
//!
//! Everything is owned by one [`ModelExecutor`]; there is no global instance.

mod config;
mod shared;
mod dispatcher;
mod pipeline;
mod pool;
mod request;

pub use config::ExecutorConfig;
pub use dispatcher::DISPATCHER_JOIN_TIMEOUT;
pub use request::{
    InferenceCallback, InferenceRequest, InferenceResult, RequestId, RequestPhase, RequestState,
    StageTimings,
};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use self::shared::{monitor_tick, ExecutorCore, MonitorState};
use self::dispatcher::Dispatcher;
use self::pool::{Stage, WorkerPools};
use self::request::TypedSink;
use crate::batch::{AlwaysCompatible, BatchPredicate, BatchingOptimizer, PriorityBand, QueueDepths};
use crate::cache::{CacheStats, PayloadSizeEstimator, ResultCache, SizeEstimator};
use crate::error::{ExecutorError, Result};
use crate::monitoring::{
    ExecutorStats, ModelStatsSnapshot, PoolSizingPolicy, ResourceMonitor, StaticPoolPolicy,
};
use crate::payload::{FromPayload, Payload};
use crate::registry::{DenseModelLoader, ExecutionDevice, ModelId, ModelInfo, ModelLoader, ModelRegistry};

/// Builder for [`ModelExecutor`]
#[derive(Default)]
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    loader: Option<Arc<dyn ModelLoader>>,
    batch_predicate: Option<Arc<dyn BatchPredicate<InferenceRequest>>>,
    pool_policy: Option<Arc<dyn PoolSizingPolicy>>,
    size_estimator: Option<Arc<dyn SizeEstimator>>,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Model loader; defaults to [`DenseModelLoader`]
    pub fn loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Extra compatibility rule for batching same-model requests
    pub fn batch_predicate(mut self, predicate: Arc<dyn BatchPredicate<InferenceRequest>>) -> Self {
        self.batch_predicate = Some(predicate);
        self
    }

    pub fn pool_policy(mut self, policy: Arc<dyn PoolSizingPolicy>) -> Self {
        self.pool_policy = Some(policy);
        self
    }

    pub fn size_estimator(mut self, estimator: Arc<dyn SizeEstimator>) -> Self {
        self.size_estimator = Some(estimator);
        self
    }

    /// Validate the configuration and start the executor threads
    pub fn build(self) -> Result<ModelExecutor> {
        self.config.validate()?;
        let config = self.config;

        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DenseModelLoader::new()));
        let estimator = self
            .size_estimator
            .unwrap_or_else(|| Arc::new(PayloadSizeEstimator::default()));
        let predicate = self
            .batch_predicate
            .unwrap_or_else(|| Arc::new(AlwaysCompatible));
        let policy = self
            .pool_policy
            .unwrap_or_else(|| Arc::new(StaticPoolPolicy));

        let cache = ResultCache::with_estimator(config.max_cache_entries, config.max_cache_bytes, estimator);
        let pools = WorkerPools::new(config.pool_sizes())?;
        let core = Arc::new(ExecutorCore::new(
            config.clone(),
            ModelRegistry::new(loader),
            cache,
            BatchingOptimizer::new(predicate),
            pools,
        ));

        let dispatcher = Dispatcher::start(core.clone())?;

        let monitor_core = core.clone();
        let interval_core = core.clone();
        let mut monitor_state = MonitorState::new();
        let monitor = ResourceMonitor::start(
            move || interval_core.config.read().monitoring_interval(),
            move || monitor_tick(&monitor_core, policy.as_ref(), &mut monitor_state),
        );
        let monitor = match monitor {
            Ok(monitor) => monitor,
            Err(e) => {
                dispatcher.stop();
                return Err(e);
            }
        };

        info!(
            inference_threads = config.inference_threads,
            preprocess_threads = config.preprocess_threads,
            postprocess_threads = config.postprocess_threads,
            batching = config.enable_batching,
            max_batch_size = config.max_batch_size,
            max_cache_entries = config.max_cache_entries,
            "Model executor started"
        );

        Ok(ModelExecutor {
            core,
            dispatcher,
            monitor,
            running: AtomicBool::new(true),
        })
    }
}

/// A submitted synchronous request waiting for its result
struct PendingResult<T> {
    request_id: RequestId,
    state: Arc<RequestState>,
    receiver: mpsc::Receiver<Result<InferenceResult<T>>>,
}

/// Concurrent model execution engine
pub struct ModelExecutor {
    core: Arc<ExecutorCore>,
    dispatcher: Dispatcher,
    monitor: ResourceMonitor,
    running: AtomicBool,
}

impl ModelExecutor {
    pub fn new(config: ExecutorConfig, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        Self::builder().config(config).loader(loader).build()
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    // ========================================================================
    // Models
    // ========================================================================

    pub fn load_model(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        device: ExecutionDevice,
    ) -> Result<ModelId> {
        self.ensure_running()?;
        self.core.registry.register_model(name, path, device)
    }

    /// Release a model and drop its cached results. False if unknown.
    pub fn unload_model(&self, model_id: &ModelId) -> bool {
        let removed = self.core.registry.unregister_model(model_id);
        if removed {
            let invalidated = self.core.cache.invalidate_model(model_id);
            info!(model_id = %model_id, invalidated, "Unloaded model");
        }
        removed
    }

    pub fn model_info(&self, model_id: &ModelId) -> Option<ModelInfo> {
        self.core.registry.get(model_id).map(|handle| handle.info())
    }

    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        self.core
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.model_info(id))
            .collect()
    }

    /// Run a zero-filled input directly on the model, bypassing queues,
    /// cache and statistics
    pub fn warm_up(&self, model_id: &ModelId) -> Result<Duration> {
        self.ensure_running()?;
        let handle = self
            .core
            .registry
            .get(model_id)
            .ok_or_else(|| ExecutorError::UnknownModel(model_id.clone()))?;

        let started = Instant::now();
        pipeline::run_guarded(|| handle.run(&Payload::zeros(handle.input_elements())))?;
        let elapsed = started.elapsed();
        info!(
            model_id = %model_id,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Model warmed up"
        );
        Ok(elapsed)
    }

    // ========================================================================
    // Inference
    // ========================================================================

    /// Run inference and wait for the result, at most `operation_timeout_ms`
    pub fn run_inference<T: FromPayload>(
        &self,
        model_id: &ModelId,
        input: impl Into<Payload>,
        priority: i32,
    ) -> Result<InferenceResult<T>> {
        let pending = self.submit_sync::<T>(model_id, input.into(), priority)?;
        let deadline = Instant::now() + self.core.config.read().operation_timeout();
        self.await_result(pending, deadline)
    }

    /// Submit a request whose outcome is delivered to `callback` on a pool
    /// thread. For an unknown model `on_error` runs on the calling thread and
    /// `None` is returned.
    pub fn run_inference_async<T, C>(
        &self,
        model_id: &ModelId,
        input: impl Into<Payload>,
        callback: C,
        priority: i32,
    ) -> Option<RequestId>
    where
        T: FromPayload,
        C: InferenceCallback<T>,
    {
        if let Err(error) = self.ensure_running() {
            callback.on_error(error);
            return None;
        }
        if !self.core.registry.contains(model_id) {
            callback.on_error(ExecutorError::UnknownModel(model_id.clone()));
            return None;
        }

        let sink = TypedSink::<T, _>::new(move |outcome| match outcome {
            Ok(result) => callback.on_result(result),
            Err(error) => callback.on_error(error),
        });
        let request = InferenceRequest::new(model_id.clone(), input.into(), priority, true, Box::new(sink));
        let request_id = request.id();
        self.core.track(request_id, request.state().clone());

        if let Some(entry) = self.core.cache.get(request.cache_key()) {
            let core = self.core.clone();
            self.core.spawn(Stage::Postprocess, move || {
                pipeline::complete_from_cache(&core, request, entry)
            });
            return Some(request_id);
        }

        match self.enqueue(request) {
            Ok(()) => Some(request_id),
            Err((request, error)) => {
                self.core.forget(&request_id);
                if request.enter(RequestPhase::Failed) {
                    request.reject(error);
                }
                None
            }
        }
    }

    /// Run one input through several models concurrently and wait for all
    pub fn run_inference_multi<T: FromPayload>(
        &self,
        model_ids: &[ModelId],
        input: impl Into<Payload>,
        priority: i32,
    ) -> HashMap<ModelId, Result<InferenceResult<T>>> {
        let input = input.into();
        let deadline = Instant::now() + self.core.config.read().operation_timeout();

        let mut results = HashMap::with_capacity(model_ids.len());
        let mut pending = Vec::with_capacity(model_ids.len());
        for model_id in model_ids {
            match self.submit_sync::<T>(model_id, input.clone(), priority) {
                Ok(p) => pending.push((model_id.clone(), p)),
                Err(error) => {
                    results.insert(model_id.clone(), Err(error));
                }
            }
        }
        for (model_id, p) in pending {
            results.insert(model_id, self.await_result(p, deadline));
        }
        results
    }

    /// Cancel an asynchronous request. False if it is unknown or already
    /// finished. A cancelled request delivers nothing.
    pub fn cancel_request(&self, request_id: &RequestId) -> bool {
        let cancelled = self.core.cancel(request_id);
        if cancelled {
            debug!(request_id = %request_id, "Request cancelled");
        }
        cancelled
    }

    // ========================================================================
    // Configuration & statistics
    // ========================================================================

    /// Validate and apply a new configuration. Pools are rebuilt when their
    /// sizes change and the cache is shrunk to the new limits.
    pub fn update_configuration(&self, config: ExecutorConfig) -> Result<()> {
        self.ensure_running()?;
        config.validate()?;

        let current_sizes = self.core.config.read().pool_sizes();
        let new_pools = if config.pool_sizes() != current_sizes {
            Some(Arc::new(WorkerPools::new(config.pool_sizes())?))
        } else {
            None
        };

        {
            let mut current = self.core.config.write();
            self.core
                .cache
                .resize(config.max_cache_entries, config.max_cache_bytes);
            self.core.queues.set_capacity(config.max_queue_size);
            if let Some(pools) = new_pools {
                self.core.swap_pools(pools);
            }
            *current = config;
        }
        self.monitor.wake();
        info!("Executor configuration updated");
        Ok(())
    }

    pub fn configuration(&self) -> ExecutorConfig {
        self.core.config.read().clone()
    }

    /// Per-model statistics for every model that has seen a request
    pub fn statistics(&self) -> HashMap<ModelId, ModelStatsSnapshot> {
        self.core.stats.snapshot()
    }

    pub fn model_statistics(&self, model_id: &ModelId) -> Option<ModelStatsSnapshot> {
        self.core.stats.model_snapshot(model_id)
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.core.stats.executor_stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.core.queues.depths()
    }

    pub fn reset_statistics(&self) {
        self.core.stats.reset();
    }

    pub fn clear_cache(&self) {
        self.core.cache.clear();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Hold dispatching; submissions keep queuing
    pub fn pause_dispatch(&self) {
        self.dispatcher.pause();
    }

    pub fn resume_dispatch(&self) {
        self.dispatcher.resume();
    }

    pub fn is_dispatch_paused(&self) -> bool {
        self.dispatcher.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop background threads, fail queued requests and release all models.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Shutting down model executor");
            self.monitor.stop();
            self.dispatcher.stop();

            let drained = self.fail_queued();
            let grace = self.core.config.read().shutdown_grace();
            if !self.core.in_flight.wait_idle(grace) {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    in_flight = self.core.in_flight.current(),
                    "In-flight work did not finish within the shutdown grace period"
                );
            }
            info!(failed_queued = drained, "Model executor stopped");
        }
        self.core.registry.release_all();
        self.core.cache.clear();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ExecutorError::ShutDown)
        }
    }

    fn submit_sync<T: FromPayload>(
        &self,
        model_id: &ModelId,
        input: Payload,
        priority: i32,
    ) -> Result<PendingResult<T>> {
        self.ensure_running()?;
        if !self.core.registry.contains(model_id) {
            return Err(ExecutorError::UnknownModel(model_id.clone()));
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        let sink = TypedSink::<T, _>::new(move |outcome| {
            let _ = sender.send(outcome);
        });
        let request = InferenceRequest::new(model_id.clone(), input, priority, false, Box::new(sink));
        let pending = PendingResult {
            request_id: request.id(),
            state: request.state().clone(),
            receiver,
        };

        match self.core.cache.get(request.cache_key()) {
            Some(entry) => pipeline::complete_from_cache(&self.core, request, entry),
            None => self.enqueue(request).map_err(|(_, error)| error)?,
        }
        Ok(pending)
    }

    fn await_result<T>(&self, pending: PendingResult<T>, deadline: Instant) -> Result<InferenceResult<T>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match pending.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if pending.state.cancel() {
                    self.core.stats.record_cancellation();
                    let timeout_ms = self.core.config.read().operation_timeout_ms;
                    warn!(request_id = %pending.request_id, timeout_ms, "Request timed out");
                    Err(ExecutorError::Timeout {
                        request_id: pending.request_id.to_string(),
                        timeout_ms,
                    })
                } else {
                    // Lost the race to a terminal transition; its outcome is on the way
                    pending.receiver.recv().unwrap_or_else(|_| Err(dropped(pending.request_id)))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(dropped(pending.request_id)),
        }
    }

    /// Place a request on its band. Gives the request back when it was not queued.
    fn enqueue(
        &self,
        request: InferenceRequest,
    ) -> std::result::Result<(), (InferenceRequest, ExecutorError)> {
        let band = {
            let config = self.core.config.read();
            PriorityBand::classify(
                request.priority(),
                config.high_priority_threshold,
                config.low_priority_threshold,
            )
        };
        let request_id = request.id();
        let priority = request.priority();
        let submitted_at = request.submitted_at();

        if let Err(rejected) = self.core.queues.push(band, request, priority, submitted_at) {
            warn!(request_id = %request_id, band = %band, "Priority queue full, rejecting request");
            return Err((rejected, ExecutorError::QueueFull(band)));
        }
        debug!(request_id = %request_id, band = %band, priority, "Request queued");

        // A shutdown that drained the queues before this push would strand the request
        if !self.is_running() {
            self.fail_queued();
        }
        Ok(())
    }

    fn fail_queued(&self) -> usize {
        let drained = self.core.queues.drain_all();
        let count = drained.len();
        for request in drained {
            self.core.forget(&request.id());
            if request.enter(RequestPhase::Failed) {
                request.reject(ExecutorError::ShutDown);
            }
        }
        count
    }
}

impl Drop for ModelExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dropped(request_id: RequestId) -> ExecutorError {
    ExecutorError::Execution(format!("request {} ended without a result", request_id))
}
