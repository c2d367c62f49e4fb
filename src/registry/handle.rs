//! Model handles and identifiers

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::loader::LoadedModel;
use crate::error::{ExecutorError, Result};
use crate::payload::Payload;

/// Opaque model identifier, unique for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(Arc<str>);

impl ModelId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

/// Execution device a model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDevice {
    Cpu,
    Gpu,
    /// Android neural-network accelerator
    Nnapi,
    /// Let the loader decide
    #[default]
    Auto,
}

impl fmt::Display for ExecutionDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionDevice::Cpu => "cpu",
            ExecutionDevice::Gpu => "gpu",
            ExecutionDevice::Nnapi => "nnapi",
            ExecutionDevice::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutionDevice {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ExecutionDevice::Cpu),
            "gpu" => Ok(ExecutionDevice::Gpu),
            "nnapi" => Ok(ExecutionDevice::Nnapi),
            "auto" => Ok(ExecutionDevice::Auto),
            other => Err(ExecutorError::invalid_parameter(
                "device",
                other,
                "expected one of cpu, gpu, nnapi, auto",
            )),
        }
    }
}

/// A loaded, runnable model plus its tensor metadata
pub struct ModelHandle {
    id: ModelId,
    name: String,
    path: PathBuf,
    device: ExecutionDevice,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    input_elements: usize,
    output_elements: usize,
    loaded_at: DateTime<Utc>,
    model: Box<dyn LoadedModel>,
    released: AtomicBool,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("device", &self.device)
            .field("input_shape", &self.input_shape)
            .field("output_shape", &self.output_shape)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ModelHandle {
    pub(crate) fn new(id: ModelId, name: &str, path: &Path, model: Box<dyn LoadedModel>) -> Self {
        let input_shape = model.input_shape().to_vec();
        let output_shape = model.output_shape().to_vec();
        Self {
            id,
            name: name.to_string(),
            path: path.to_path_buf(),
            device: model.device(),
            input_elements: input_shape.iter().product(),
            output_elements: output_shape.iter().product(),
            input_shape,
            output_shape,
            loaded_at: Utc::now(),
            model,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn device(&self) -> ExecutionDevice {
        self.device
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    /// Flat element count of the input tensor
    pub fn input_elements(&self) -> usize {
        self.input_elements
    }

    /// Flat element count of the output tensor
    pub fn output_elements(&self) -> usize {
        self.output_elements
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the native execution context; later runs fail
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.model.release();
        }
    }

    /// Check a numeric input against the input tensor size
    pub fn validate_input(&self, input: &Payload) -> Result<()> {
        match input.element_count() {
            Some(count) if count != self.input_elements => Err(ExecutorError::ShapeMismatch {
                expected: format!("{:?} ({} elements)", self.input_shape, self.input_elements),
                actual: format!("{} elements", count),
            }),
            None if input.is_numeric() => Err(ExecutorError::ShapeMismatch {
                expected: format!("{} elements", self.input_elements),
                actual: "a byte buffer that is not a whole number of f32 values".to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn run(&self, input: &Payload) -> Result<Payload> {
        self.ensure_live()?;
        self.model.run(input)
    }

    pub fn run_batch(&self, inputs: &[Payload]) -> Result<Vec<Payload>> {
        self.ensure_live()?;
        let outputs = self.model.run_batch(inputs)?;
        if outputs.len() != inputs.len() {
            return Err(ExecutorError::Execution(format!(
                "batch produced {} outputs for {} inputs",
                outputs.len(),
                inputs.len()
            )));
        }
        Ok(outputs)
    }

    pub fn confidence(&self, output: &Payload) -> f32 {
        self.model.confidence(output)
    }

    /// Serializable metadata snapshot
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            device: self.device,
            input_shape: self.input_shape.clone(),
            output_shape: self.output_shape.clone(),
            input_elements: self.input_elements,
            output_elements: self.output_elements,
            loaded_at: self.loaded_at,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(ExecutorError::Execution(format!(
                "model {} has been released",
                self.id
            )));
        }
        Ok(())
    }
}

/// Metadata of a loaded model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: ModelId,
    pub name: String,
    pub path: PathBuf,
    pub device: ExecutionDevice,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub input_elements: usize,
    pub output_elements: usize,
    pub loaded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ids_are_unique() {
        let a = ModelId::generate();
        let b = ModelId::generate();
        assert_ne!(a, b);
        assert_eq!(ModelId::from(a.as_str()), a);
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("GPU".parse::<ExecutionDevice>().unwrap(), ExecutionDevice::Gpu);
        assert_eq!("nnapi".parse::<ExecutionDevice>().unwrap(), ExecutionDevice::Nnapi);
        assert!("tpu".parse::<ExecutionDevice>().is_err());
        assert_eq!(ExecutionDevice::default(), ExecutionDevice::Auto);
    }

    #[test]
    fn test_model_id_serializes_as_string() {
        let id = ModelId::from("m-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"m-1\"");
        assert_eq!(serde_json::from_str::<ModelId>(&json).unwrap(), id);
    }

    #[test]
    fn test_model_info_json_roundtrip() {
        let info = ModelInfo {
            id: ModelId::generate(),
            name: "classifier".to_string(),
            path: PathBuf::from("models/classifier.json"),
            device: ExecutionDevice::Cpu,
            input_shape: vec![4],
            output_shape: vec![3],
            input_elements: 4,
            output_elements: 3,
            loaded_at: Utc::now(),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["id"], serde_json::Value::String(info.id.as_str().to_string()));

        let restored: ModelInfo = serde_json::from_value(value).unwrap();
        assert_eq!(restored, info);
    }
}
