//! Model loader collaborator
//!
//! The executor never parses model files itself. A [`ModelLoader`] turns a
//! path into a [`LoadedModel`], which exposes its tensor shapes and runs
//! numeric payloads.

use std::path::Path;

use crate::error::{ExecutorError, Result};
use crate::payload::Payload;
use super::handle::ExecutionDevice;

/// Reads a model from storage and produces a runnable model
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, device: ExecutionDevice) -> Result<Box<dyn LoadedModel>>;
}

/// A runnable model
pub trait LoadedModel: Send + Sync {
    fn input_shape(&self) -> &[usize];

    fn output_shape(&self) -> &[usize];

    /// Device the model actually runs on (never `Auto`)
    fn device(&self) -> ExecutionDevice;

    /// Run a single input. Backends accept `Floats` and `Bytes`; other kinds
    /// fail with [`ExecutorError::UnsupportedInput`].
    fn run(&self, input: &Payload) -> Result<Payload>;

    /// Run several inputs in one call. One output per input, in order.
    fn run_batch(&self, inputs: &[Payload]) -> Result<Vec<Payload>> {
        inputs.iter().map(|input| self.run(input)).collect()
    }

    /// Confidence attached to a cached result
    fn confidence(&self, _output: &Payload) -> f32 {
        1.0
    }

    /// Free native resources. Called once.
    fn release(&self) {}
}

/// Error for a payload kind a backend cannot consume
pub fn unsupported_input(input: &Payload, device: ExecutionDevice) -> ExecutorError {
    ExecutorError::UnsupportedInput {
        kind: input.kind().to_string(),
        device,
    }
}
