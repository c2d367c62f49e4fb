//! Model Executor - concurrent on-device inference engine
//!
//! This crate schedules, batches, caches and executes inference requests from
//! many concurrent callers against a registry of loaded models:
//! - Priority-banded request queues with a single dispatcher thread
//! - Same-model request batching
//! - Staged worker pools (preprocess, inference, postprocess)
//! - LRU result cache bounded by entry count and bytes
//! - Per-model statistics and a background resource monitor
//!
//! # Modules
//!
//! - [`executor`] - The [`ModelExecutor`] facade, configuration and request types
//! - [`registry`] - Model loading and lifecycle
//! - [`cache`] - Result caching
//! - [`batch`] - Priority queues and the batching optimizer
//! - [`monitoring`] - Statistics and resource monitoring
//! - [`payload`] - Tensor payloads and output conversions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use model_executor::prelude::*;
//!
//! # fn main() -> model_executor::Result<()> {
//! let executor = ModelExecutor::new(ExecutorConfig::default(), Arc::new(DenseModelLoader::new()))?;
//! let model = executor.load_model("classifier", "models/classifier.json", ExecutionDevice::Auto)?;
//!
//! let result = executor.run_inference::<Vec<f32>>(&model, vec![0.1_f32, 0.2, 0.3, 0.4], 5)?;
//! println!("{:?} in {:?}", result.output, result.total_time());
//!
//! executor.shutdown();
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

pub mod payload;
pub mod registry;
pub mod cache;
pub mod batch;
pub mod monitoring;
pub mod executor;

pub use error::{ErrorKind, ExecutorError, Result};
pub use executor::{ExecutorBuilder, ExecutorConfig, ModelExecutor};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{ErrorKind, ExecutorError, Result};

    // Executor
    pub use crate::executor::{
        ExecutorBuilder, ExecutorConfig, InferenceCallback, InferenceRequest, InferenceResult,
        ModelExecutor, RequestId, RequestPhase, StageTimings,
    };

    // Models
    pub use crate::registry::{
        DenseModelLoader, ExecutionDevice, LoadedModel, ModelId, ModelInfo, ModelLoader,
    };

    // Payloads
    pub use crate::payload::{FromPayload, Payload, PayloadKind};

    // Batching & caching
    pub use crate::batch::{BatchPredicate, PriorityBand};
    pub use crate::cache::{CacheStats, SizeEstimator};

    // Monitoring
    pub use crate::monitoring::{
        ExecutorStats, LoadSnapshot, ModelStatsSnapshot, PoolSizes, PoolSizingPolicy,
        QueueDepthPolicy, StaticPoolPolicy,
    };
}
