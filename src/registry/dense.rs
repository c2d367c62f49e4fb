//! Dense-layer reference loader
//!
//! Reads a JSON descriptor and evaluates `activation(W · x + b)` on the CPU.
//! Useful as a stand-in for native backends in tests and benchmarks, and as a
//! template for implementing [`ModelLoader`].
//!
//! ```json
//! {
//!   "input_shape": [4],
//!   "output_shape": [2],
//!   "weights": [[0.1, 0.2, 0.3, 0.4], [0.4, 0.3, 0.2, 0.1]],
//!   "bias": [0.0, 0.0],
//!   "activation": "softmax"
//! }
//! ```

use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::handle::ExecutionDevice;
use super::loader::{unsupported_input, LoadedModel, ModelLoader};
use crate::error::{ExecutorError, Result};
use crate::payload::{decode_f32_le, encode_f32_le, Payload};

/// Output activation of a dense model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Softmax,
}

/// On-disk descriptor of a dense model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseModelSpec {
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// One row per output element, each `input_elements` long
    pub weights: Vec<Vec<f32>>,
    #[serde(default)]
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseModelSpec {
    fn validate(&self) -> std::result::Result<(), String> {
        let inputs: usize = self.input_shape.iter().product();
        let outputs: usize = self.output_shape.iter().product();
        if inputs == 0 || outputs == 0 {
            return Err("tensor shapes must be non-empty".to_string());
        }
        if self.weights.len() != outputs {
            return Err(format!(
                "expected {} weight rows, found {}",
                outputs,
                self.weights.len()
            ));
        }
        if let Some(row) = self.weights.iter().position(|row| row.len() != inputs) {
            return Err(format!("weight row {} does not have {} columns", row, inputs));
        }
        if !self.bias.is_empty() && self.bias.len() != outputs {
            return Err(format!("expected {} bias values, found {}", outputs, self.bias.len()));
        }
        Ok(())
    }
}

/// Loader for JSON dense-layer descriptors. CPU only.
#[derive(Debug, Clone, Default)]
pub struct DenseModelLoader;

impl DenseModelLoader {
    pub fn new() -> Self {
        Self
    }

    /// Build a model directly from a descriptor
    pub fn from_spec(spec: DenseModelSpec) -> Result<DenseModel> {
        spec.validate()
            .map_err(|reason| ExecutorError::model_load("<in-memory>", reason))?;
        Ok(DenseModel::new(spec))
    }
}

impl ModelLoader for DenseModelLoader {
    fn load(&self, path: &Path, device: ExecutionDevice) -> Result<Box<dyn LoadedModel>> {
        let display = path.display().to_string();
        if matches!(device, ExecutionDevice::Gpu | ExecutionDevice::Nnapi) {
            return Err(ExecutorError::model_load(
                display,
                format!("device {} is not supported by the dense loader", device),
            ));
        }

        let raw = fs::read(path).map_err(|e| ExecutorError::model_load(display.clone(), e))?;
        let spec: DenseModelSpec = serde_json::from_slice(&raw)
            .map_err(|e| ExecutorError::model_load(display.clone(), e))?;
        spec.validate()
            .map_err(|reason| ExecutorError::model_load(display, reason))?;

        Ok(Box::new(DenseModel::new(spec)))
    }
}

/// A dense layer evaluated on the CPU
#[derive(Debug, Clone)]
pub struct DenseModel {
    spec: DenseModelSpec,
    input_elements: usize,
}

impl DenseModel {
    fn new(spec: DenseModelSpec) -> Self {
        let input_elements = spec.input_shape.iter().product();
        Self { spec, input_elements }
    }

    fn forward(&self, x: &[f32]) -> Result<Vec<f32>> {
        if x.len() != self.input_elements {
            return Err(ExecutorError::ShapeMismatch {
                expected: format!("{} elements", self.input_elements),
                actual: format!("{} elements", x.len()),
            });
        }

        let mut y: Vec<f32> = self
            .spec
            .weights
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let dot: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
                dot + self.spec.bias.get(i).copied().unwrap_or(0.0)
            })
            .collect();

        match self.spec.activation {
            Activation::Identity => {}
            Activation::Relu => y.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Sigmoid => y.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
            Activation::Softmax => {
                let max = y.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for v in y.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                if sum > 0.0 {
                    y.iter_mut().for_each(|v| *v /= sum);
                }
            }
        }
        Ok(y)
    }
}

impl LoadedModel for DenseModel {
    fn input_shape(&self) -> &[usize] {
        &self.spec.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.spec.output_shape
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }

    fn run(&self, input: &Payload) -> Result<Payload> {
        match input {
            Payload::Floats(values) => Ok(Payload::from(self.forward(values)?)),
            Payload::Bytes(bytes) => {
                let values = decode_f32_le(bytes)?;
                Ok(Payload::from(encode_f32_le(&self.forward(&values)?)))
            }
            other => Err(unsupported_input(other, self.device())),
        }
    }

    fn run_batch(&self, inputs: &[Payload]) -> Result<Vec<Payload>> {
        inputs.par_iter().map(|input| self.run(input)).collect()
    }

    fn confidence(&self, output: &Payload) -> f32 {
        match (self.spec.activation, output.as_floats()) {
            (Activation::Softmax, Some(probs)) => probs.iter().copied().fold(0.0, f32::max),
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn spec() -> DenseModelSpec {
        DenseModelSpec {
            input_shape: vec![4],
            output_shape: vec![2],
            weights: vec![vec![1.0, 1.0, 1.0, 1.0], vec![1.0, -1.0, 1.0, -1.0]],
            bias: vec![0.5, 0.0],
            activation: Activation::Identity,
        }
    }

    #[test]
    fn test_forward_floats() {
        let model = DenseModelLoader::from_spec(spec()).unwrap();
        let out = model.run(&Payload::from(vec![1.0_f32, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(out.as_floats().unwrap(), &[10.5, -2.0]);
    }

    #[test]
    fn test_forward_bytes() {
        let model = DenseModelLoader::from_spec(spec()).unwrap();
        let input = Payload::from(encode_f32_le(&[1.0, 0.0, 0.0, 0.0]));
        let out = model.run(&input).unwrap();
        assert!(matches!(out, Payload::Bytes(_)));
        assert_eq!(out.to_f32_vec().unwrap(), vec![1.5, 1.0]);
    }

    #[test]
    fn test_text_input_unsupported() {
        let model = DenseModelLoader::from_spec(spec()).unwrap();
        let err = model.run(&Payload::from("frame")).unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedInput { .. }));
    }

    #[test]
    fn test_softmax_confidence() {
        let mut s = spec();
        s.activation = Activation::Softmax;
        let model = DenseModelLoader::from_spec(s).unwrap();
        let out = model.run(&Payload::from(vec![1.0_f32, 1.0, 1.0, 1.0])).unwrap();
        let probs = out.as_floats().unwrap();
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(model.confidence(&out) > 0.5);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&spec()).unwrap()).unwrap();

        let model = DenseModelLoader::new()
            .load(file.path(), ExecutionDevice::Auto)
            .unwrap();
        assert_eq!(model.input_shape(), &[4]);
        assert_eq!(model.device(), ExecutionDevice::Cpu);
    }

    #[test]
    fn test_load_rejects_malformed() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{\"input_shape\": [4]").unwrap();
        let err = DenseModelLoader::new()
            .load(file.path(), ExecutionDevice::Cpu)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutorError::ModelLoad { .. }));

        let mut bad = spec();
        bad.weights.pop();
        assert!(DenseModelLoader::from_spec(bad).is_err());
    }

    #[test]
    fn test_load_rejects_gpu() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&spec()).unwrap()).unwrap();
        let result = DenseModelLoader::new().load(file.path(), ExecutionDevice::Gpu);
        assert!(matches!(result, Err(ExecutorError::ModelLoad { .. })));
    }
}
