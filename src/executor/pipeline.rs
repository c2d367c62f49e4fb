//! Execution pipeline
//!
//! A dispatched unit (one request or a same-model batch) moves through three
//! pools: preprocess, inference, postprocess. Each stage checks the request
//! state first so a cancelled request stops at the next boundary, and only the
//! thread that wins the terminal transition touches the cache, the statistics
//! or the caller.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::shared::ExecutorCore;
use super::pool::Stage;
use super::request::{InferenceRequest, RequestPhase};
use crate::cache::CacheEntry;
use crate::error::{ExecutorError, Result};
use crate::payload::Payload;
use crate::registry::ModelHandle;

/// Hand a unit to the preprocess pool
pub(crate) fn dispatch(core: &Arc<ExecutorCore>, mut batch: Vec<InferenceRequest>) {
    if batch.is_empty() {
        return;
    }
    if batch.len() > 1 {
        batch.iter_mut().for_each(InferenceRequest::mark_batched);
        debug!(model_id = %batch[0].model_id(), size = batch.len(), "Dispatching batch");
    }
    let task_core = core.clone();
    core.spawn(Stage::Preprocess, move || preprocess(task_core, batch));
}

fn preprocess(core: Arc<ExecutorCore>, batch: Vec<InferenceRequest>) {
    let mut ready = Vec::with_capacity(batch.len());
    let mut handle: Option<Arc<ModelHandle>> = None;

    for mut request in batch {
        if !request.enter(RequestPhase::Preprocessing) {
            debug!(request_id = %request.id(), "Skipping cancelled request");
            continue;
        }
        let started = Instant::now();

        if let Some(entry) = core.cache.get(request.cache_key()) {
            complete_from_cache(&core, request, entry);
            continue;
        }

        if handle.is_none() {
            handle = core.registry.get(request.model_id());
        }
        let Some(model) = handle.as_ref() else {
            let error = ExecutorError::UnknownModel(request.model_id().clone());
            fail(&core, request, error);
            continue;
        };

        if let Err(error) = model.validate_input(request.input()) {
            fail(&core, request, error);
            continue;
        }

        request.timings_mut().preprocess = started.elapsed();
        ready.push(request);
    }

    if let (Some(model), false) = (handle, ready.is_empty()) {
        let task_core = core.clone();
        core.spawn(Stage::Inference, move || infer(task_core, model, ready));
    }
}

fn infer(core: Arc<ExecutorCore>, model: Arc<ModelHandle>, batch: Vec<InferenceRequest>) {
    let batch: Vec<InferenceRequest> = batch
        .into_iter()
        .filter(|request| request.enter(RequestPhase::Inferencing))
        .collect();
    if batch.is_empty() {
        return;
    }

    let started = Instant::now();
    let inputs: Vec<Payload> = batch.iter().map(|r| r.input().clone()).collect();
    let outcomes: Vec<Result<Payload>> = if inputs.len() == 1 {
        vec![run_guarded(|| model.run(&inputs[0]))]
    } else {
        match run_guarded(|| model.run_batch(&inputs)) {
            Ok(outputs) => outputs.into_iter().map(Ok).collect(),
            Err(error) => {
                warn!(
                    model_id = %model.id(),
                    size = inputs.len(),
                    error = %error,
                    "Batch inference failed, retrying requests individually"
                );
                inputs
                    .iter()
                    .map(|input| run_guarded(|| model.run(input)))
                    .collect()
            }
        }
    };
    let share = started.elapsed() / batch.len() as u32;

    let items: Vec<(InferenceRequest, Result<Payload>)> = batch
        .into_iter()
        .zip(outcomes)
        .map(|(mut request, outcome)| {
            request.timings_mut().inference = share;
            (request, outcome)
        })
        .collect();

    let task_core = core.clone();
    core.spawn(Stage::Postprocess, move || postprocess(task_core, model, items));
}

fn postprocess(
    core: Arc<ExecutorCore>,
    model: Arc<ModelHandle>,
    items: Vec<(InferenceRequest, Result<Payload>)>,
) {
    for (mut request, outcome) in items {
        if !request.enter(RequestPhase::Postprocessing) {
            continue;
        }
        let started = Instant::now();

        let output = match outcome {
            Ok(output) => output,
            Err(error) => {
                fail(&core, request, error);
                continue;
            }
        };
        if let Err(error) = request.convert_output(&output) {
            fail(&core, request, error);
            continue;
        }
        let confidence = model.confidence(&output);
        request.timings_mut().postprocess = started.elapsed();

        if !request.enter(RequestPhase::Completed) {
            continue;
        }
        core.cache
            .put(request.cache_key().clone(), CacheEntry::new(output, confidence));
        let completion = request.completion(confidence, false);
        core.stats
            .record_completion(request.model_id(), &completion.timings, false);
        record_batched(&core, &request);
        core.forget(&request.id());
        debug!(
            request_id = %request.id(),
            model_id = %request.model_id(),
            total_ms = completion.timings.total.as_secs_f64() * 1000.0,
            "Request completed"
        );
        request.deliver(completion);
    }
}

/// Complete a request from a cached result
pub(crate) fn complete_from_cache(core: &ExecutorCore, mut request: InferenceRequest, entry: CacheEntry) {
    if let Err(error) = request.convert_output(&entry.output) {
        fail(core, request, error);
        return;
    }
    if !request.enter(RequestPhase::Completed) {
        return;
    }
    let completion = request.completion(entry.confidence, true);
    core.stats
        .record_completion(request.model_id(), &completion.timings, true);
    record_batched(core, &request);
    core.forget(&request.id());
    debug!(request_id = %request.id(), model_id = %request.model_id(), "Served from cache");
    request.deliver(completion);
}

/// Fail a request unless it already reached a terminal state
pub(crate) fn fail(core: &ExecutorCore, request: InferenceRequest, error: ExecutorError) {
    if !request.enter(RequestPhase::Failed) {
        return;
    }
    core.stats.record_failure(request.model_id());
    record_batched(core, &request);
    core.forget(&request.id());
    debug!(
        request_id = %request.id(),
        model_id = %request.model_id(),
        error = %error,
        "Request failed"
    );
    request.reject(error);
}

fn record_batched(core: &ExecutorCore, request: &InferenceRequest) {
    if request.is_batched() {
        core.stats.record_batched();
    }
}

/// Run model code, turning a panic into an execution error
pub(crate) fn run_guarded<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(ExecutorError::Execution(format!(
            "model panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
