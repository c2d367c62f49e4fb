//! Error types for the model executor

use thiserror::Error;

use crate::batch::PriorityBand;
use crate::registry::{ExecutionDevice, ModelId};

/// Result type alias for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Coarse classification of an [`ExecutorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Loading a model failed; the model was never registered
    ModelLoad,
    /// A single request failed; the executor stays operational
    ModelExecution,
    /// A configuration was rejected; the previous one stays active
    Configuration,
}

/// Main error type for the executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Model not found: {0}")]
    UnknownModel(ModelId),

    #[error("Unsupported input type {kind} for {device} backend")]
    UnsupportedInput { kind: String, device: ExecutionDevice },

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Unsupported output conversion from {from} to {to}")]
    OutputConversion { from: String, to: String },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Request {request_id} timed out after {timeout_ms} ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("{0} priority queue is full")]
    QueueFull(PriorityBand),

    #[error("Executor is shut down")]
    ShutDown,

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ExecutorError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::ModelLoad { .. } | ExecutorError::Io(_) => ErrorKind::ModelLoad,
            ExecutorError::InvalidParameter { .. }
            | ExecutorError::Config(_)
            | ExecutorError::ThreadPool(_) => ErrorKind::Configuration,
            ExecutorError::Serialization(_) => ErrorKind::Configuration,
            _ => ErrorKind::ModelExecution,
        }
    }

    /// True for per-request execution failures
    pub fn is_execution_error(&self) -> bool {
        self.kind() == ErrorKind::ModelExecution
    }

    pub(crate) fn model_load(path: impl Into<String>, reason: impl ToString) -> Self {
        ExecutorError::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_parameter(
        name: &str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        ExecutorError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        ExecutorError::Serialization(err.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for ExecutorError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        ExecutorError::ThreadPool(err.to_string())
    }
}
