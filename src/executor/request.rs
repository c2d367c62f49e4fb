//! Inference requests and result delivery

use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::pipeline::panic_message;
use crate::batch::BatchItem;
use crate::cache::CacheKey;
use crate::error::{ExecutorError, Result};
use crate::payload::{FromPayload, Payload};
use crate::registry::ModelId;

/// Identifier of a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle phase of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestPhase {
    Queued = 0,
    Preprocessing = 1,
    Inferencing = 2,
    Postprocessing = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl RequestPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestPhase::Queued,
            1 => RequestPhase::Preprocessing,
            2 => RequestPhase::Inferencing,
            3 => RequestPhase::Postprocessing,
            4 => RequestPhase::Completed,
            6 => RequestPhase::Cancelled,
            _ => RequestPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Completed | RequestPhase::Failed | RequestPhase::Cancelled
        )
    }
}

/// Shared lifecycle state; exactly one terminal transition succeeds
#[derive(Debug)]
pub struct RequestState {
    phase: AtomicU8,
}

impl RequestState {
    pub(crate) fn new() -> Self {
        Self {
            phase: AtomicU8::new(RequestPhase::Queued as u8),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        RequestPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == RequestPhase::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Move to `to` unless a terminal phase was already reached
    pub(crate) fn transition(&self, to: RequestPhase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if RequestPhase::from_u8(current).is_terminal() {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn cancel(&self) -> bool {
        self.transition(RequestPhase::Cancelled)
    }
}

/// Time spent in each stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub preprocess: Duration,
    pub inference: Duration,
    pub postprocess: Duration,
    /// Completion minus submission
    pub total: Duration,
}

impl StageTimings {
    /// Preprocess plus postprocess
    pub fn processing(&self) -> Duration {
        self.preprocess + self.postprocess
    }
}

/// A completed inference
#[derive(Debug, Clone)]
pub struct InferenceResult<T> {
    pub request_id: RequestId,
    pub model_id: ModelId,
    pub output: T,
    pub confidence: f32,
    pub from_cache: bool,
    pub submitted_at: Instant,
    pub completed_at: Instant,
    pub timings: StageTimings,
}

impl<T> InferenceResult<T> {
    pub fn total_time(&self) -> Duration {
        self.timings.total
    }

    pub fn inference_time(&self) -> Duration {
        self.timings.inference
    }

    pub fn processing_time(&self) -> Duration {
        self.timings.processing()
    }
}

/// Receives the outcome of an asynchronous request on a pool thread
pub trait InferenceCallback<T>: Send + 'static {
    fn on_result(&self, result: InferenceResult<T>);

    fn on_error(&self, error: ExecutorError);
}

impl<T, F> InferenceCallback<T> for F
where
    F: Fn(Result<InferenceResult<T>>) + Send + 'static,
{
    fn on_result(&self, result: InferenceResult<T>) {
        self(Ok(result))
    }

    fn on_error(&self, error: ExecutorError) {
        self(Err(error))
    }
}

/// Everything about a completion except the converted output
#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub confidence: f32,
    pub from_cache: bool,
    pub completed_at: Instant,
    pub timings: StageTimings,
}

/// Type-erased receiver of a request's outcome
pub(crate) trait ResultSink: Send {
    /// Convert the raw output into the caller's type, keeping it for delivery
    fn convert(&mut self, output: &Payload) -> Result<()>;

    fn deliver(
        self: Box<Self>,
        request_id: RequestId,
        model_id: ModelId,
        submitted_at: Instant,
        completion: Completion,
    );

    fn fail(self: Box<Self>, error: ExecutorError);
}

pub(crate) struct TypedSink<T, F> {
    converted: Option<T>,
    on_done: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> TypedSink<T, F>
where
    T: FromPayload,
    F: FnOnce(Result<InferenceResult<T>>) + Send + 'static,
{
    pub(crate) fn new(on_done: F) -> Self {
        Self {
            converted: None,
            on_done,
            _marker: PhantomData,
        }
    }
}

impl<T, F> ResultSink for TypedSink<T, F>
where
    T: FromPayload,
    F: FnOnce(Result<InferenceResult<T>>) + Send + 'static,
{
    fn convert(&mut self, output: &Payload) -> Result<()> {
        self.converted = Some(T::from_payload(output)?);
        Ok(())
    }

    fn deliver(
        self: Box<Self>,
        request_id: RequestId,
        model_id: ModelId,
        submitted_at: Instant,
        completion: Completion,
    ) {
        let this = *self;
        let outcome = match this.converted {
            Some(output) => Ok(InferenceResult {
                request_id,
                model_id,
                output,
                confidence: completion.confidence,
                from_cache: completion.from_cache,
                submitted_at,
                completed_at: completion.completed_at,
                timings: completion.timings,
            }),
            None => Err(ExecutorError::Execution(format!(
                "request {} completed without a converted output",
                request_id
            ))),
        };
        (this.on_done)(outcome);
    }

    fn fail(self: Box<Self>, error: ExecutorError) {
        let this = *self;
        (this.on_done)(Err(error));
    }
}

/// A queued or in-flight inference request
pub struct InferenceRequest {
    id: RequestId,
    model_id: ModelId,
    input: Payload,
    priority: i32,
    submitted_at: Instant,
    is_async: bool,
    batched: bool,
    cache_key: CacheKey,
    state: Arc<RequestState>,
    timings: StageTimings,
    sink: Box<dyn ResultSink>,
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("input_kind", &self.input.kind())
            .field("priority", &self.priority)
            .field("is_async", &self.is_async)
            .field("batched", &self.batched)
            .field("phase", &self.state.phase())
            .finish()
    }
}

impl InferenceRequest {
    pub(crate) fn new(
        model_id: ModelId,
        input: Payload,
        priority: i32,
        is_async: bool,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        let cache_key = CacheKey::new(model_id.clone(), &input);
        Self {
            id: RequestId::new(),
            model_id,
            input,
            priority,
            submitted_at: Instant::now(),
            is_async,
            batched: false,
            cache_key,
            state: Arc::new(RequestState::new()),
            timings: StageTimings::default(),
            sink,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn input(&self) -> &Payload {
        &self.input
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn phase(&self) -> RequestPhase {
        self.state.phase()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Whether the request was dispatched as part of a multi-request batch
    pub fn is_batched(&self) -> bool {
        self.batched
    }

    pub(crate) fn mark_batched(&mut self) {
        self.batched = true;
    }

    pub(crate) fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub(crate) fn state(&self) -> &Arc<RequestState> {
        &self.state
    }

    pub(crate) fn timings_mut(&mut self) -> &mut StageTimings {
        &mut self.timings
    }

    /// Enter a non-terminal stage. False once the request is terminal.
    pub(crate) fn enter(&self, phase: RequestPhase) -> bool {
        self.state.transition(phase)
    }

    pub(crate) fn convert_output(&mut self, output: &Payload) -> Result<()> {
        self.sink.convert(output)
    }

    /// Stamp completion time and total latency
    pub(crate) fn completion(&self, confidence: f32, from_cache: bool) -> Completion {
        let completed_at = Instant::now();
        let mut timings = self.timings;
        timings.total = completed_at.saturating_duration_since(self.submitted_at);
        Completion {
            confidence,
            from_cache,
            completed_at,
            timings,
        }
    }

    /// Hand the converted output to the caller. The caller must have won the
    /// `Completed` transition.
    pub(crate) fn deliver(self, completion: Completion) {
        let Self {
            id,
            model_id,
            submitted_at,
            sink,
            ..
        } = self;
        guard_callback(id, move || sink.deliver(id, model_id, submitted_at, completion));
    }

    /// Report an error to the caller. The caller must have won the `Failed`
    /// transition.
    pub(crate) fn reject(self, error: ExecutorError) {
        let Self { id, sink, .. } = self;
        guard_callback(id, move || sink.fail(error));
    }
}

/// Run a caller's result callback. A panic is logged and stops there, so the
/// stage task carrying the rest of a batch keeps going.
fn guard_callback(request_id: RequestId, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            request_id = %request_id,
            panic = %panic_message(payload.as_ref()),
            "Result callback panicked"
        );
    }
}

impl BatchItem for InferenceRequest {
    type Key = ModelId;

    fn batch_key(&self) -> &ModelId {
        &self.model_id
    }
}
