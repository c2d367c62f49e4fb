//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use model_executor::prelude::*;
use parking_lot::Mutex;

pub type RunFn = Arc<dyn Fn(&Payload) -> Result<Payload> + Send + Sync>;

/// Everything the scripted models observed
#[derive(Clone, Default)]
pub struct CallLog {
    pub runs: Arc<AtomicUsize>,
    pub batch_sizes: Arc<Mutex<Vec<usize>>>,
    /// First element of every input, in execution order
    pub order: Arc<Mutex<Vec<f32>>>,
}

impl CallLog {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }

    pub fn order(&self) -> Vec<f32> {
        self.order.lock().clone()
    }
}

struct ScriptedModel {
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    run: RunFn,
    log: CallLog,
}

impl LoadedModel for ScriptedModel {
    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn device(&self) -> ExecutionDevice {
        ExecutionDevice::Cpu
    }

    fn run(&self, input: &Payload) -> Result<Payload> {
        self.log.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(first) = input.as_floats().and_then(|values| values.first()) {
            self.log.order.lock().push(*first);
        }
        (self.run)(input)
    }

    fn run_batch(&self, inputs: &[Payload]) -> Result<Vec<Payload>> {
        self.log.batch_sizes.lock().push(inputs.len());
        inputs.iter().map(|input| self.run(input)).collect()
    }
}

/// Loader that serves in-memory models keyed by path
#[derive(Default)]
pub struct ScriptedLoader {
    models: Mutex<HashMap<PathBuf, (usize, usize, RunFn)>>,
    pub log: CallLog,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, path: &str, inputs: usize, outputs: usize, run: RunFn) -> Self {
        self.models
            .lock()
            .insert(PathBuf::from(path), (inputs, outputs, run));
        self
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, path: &Path, _device: ExecutionDevice) -> Result<Box<dyn LoadedModel>> {
        let models = self.models.lock();
        let (inputs, outputs, run) = models.get(path).ok_or_else(|| ExecutorError::ModelLoad {
            path: path.display().to_string(),
            reason: "no such scripted model".to_string(),
        })?;
        Ok(Box::new(ScriptedModel {
            input_shape: vec![*inputs],
            output_shape: vec![*outputs],
            run: run.clone(),
            log: self.log.clone(),
        }))
    }
}

/// Multiply every element by `factor`
pub fn scale(factor: f32) -> RunFn {
    Arc::new(move |input: &Payload| -> Result<Payload> {
        let values = input.to_f32_vec()?;
        Ok(Payload::from(values.iter().map(|v| v * factor).collect::<Vec<f32>>()))
    })
}

/// Sleep, then echo the input
pub fn slow(delay: Duration) -> RunFn {
    Arc::new(move |input: &Payload| -> Result<Payload> {
        thread::sleep(delay);
        Ok(input.clone())
    })
}

pub fn panicking() -> RunFn {
    Arc::new(|_: &Payload| -> Result<Payload> { panic!("weights corrupted") })
}

/// Small pools and a short poll so tests stay quick
pub fn test_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_inference_threads(2)
        .with_preprocess_threads(1)
        .with_postprocess_threads(1)
        .with_dispatch_poll_ms(2)
        .with_operation_timeout_ms(5_000)
        .with_shutdown_grace_ms(500)
}

/// Single-threaded stages, so execution order equals dispatch order
pub fn serial_config() -> ExecutorConfig {
    test_config()
        .with_inference_threads(1)
        .without_batching()
}

pub fn executor_with(loader: ScriptedLoader, config: ExecutorConfig) -> (ModelExecutor, CallLog) {
    let log = loader.log.clone();
    let executor = ModelExecutor::new(config, Arc::new(loader)).unwrap();
    (executor, log)
}

/// Write a 4 -> 2 softmax dense model descriptor
pub fn write_dense_model(dir: &Path) -> PathBuf {
    let path = dir.join("m1.json");
    let descriptor = serde_json::json!({
        "input_shape": [4],
        "output_shape": [2],
        "weights": [[0.1, 0.2, 0.3, 0.4], [0.4, 0.3, 0.2, 0.1]],
        "bias": [0.0, 0.5],
        "activation": "softmax"
    });
    std::fs::write(&path, descriptor.to_string()).unwrap();
    path
}

/// Collects async outcomes for later inspection
pub struct Collector<T> {
    outcomes: Arc<Mutex<Vec<Result<InferenceResult<T>>>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            outcomes: self.outcomes.clone(),
        }
    }
}

impl<T: FromPayload> Collector<T> {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn callback(&self) -> impl Fn(Result<InferenceResult<T>>) + Send + 'static {
        let outcomes = self.outcomes.clone();
        move |outcome| outcomes.lock().push(outcome)
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Wait until `count` outcomes arrived or `timeout` passed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.len() >= count
    }

    pub fn take(&self) -> Vec<Result<InferenceResult<T>>> {
        std::mem::take(&mut *self.outcomes.lock())
    }
}
