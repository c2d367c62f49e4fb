//! Model Registry
//!
//! Owns loaded model handles keyed by [`ModelId`]. Lookups take the read lock
//! so concurrent requests never serialize on each other; load, unload and
//! release take the write lock.

mod dense;
mod handle;
mod loader;

pub use dense::{Activation, DenseModel, DenseModelLoader, DenseModelSpec};
pub use handle::{ExecutionDevice, ModelHandle, ModelId, ModelInfo};
pub use loader::{unsupported_input, LoadedModel, ModelLoader};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::Result;

/// Thread-safe registry of loaded models
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    models: RwLock<HashMap<ModelId, Arc<ModelHandle>>>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Load a model and register it under a fresh identifier
    pub fn register_model(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        device: ExecutionDevice,
    ) -> Result<ModelId> {
        let path = path.as_ref();
        // The loader may be slow; only the insert needs the write lock.
        let model = self.loader.load(path, device)?;

        let id = ModelId::generate();
        let handle = Arc::new(ModelHandle::new(id.clone(), name, path, model));
        info!(
            model_id = %id,
            model_name = name,
            device = %handle.device(),
            input_shape = ?handle.input_shape(),
            output_shape = ?handle.output_shape(),
            "Registered model"
        );

        self.models.write().insert(id.clone(), handle);
        Ok(id)
    }

    /// Remove and release a model. Returns false if the id is unknown.
    pub fn unregister_model(&self, id: &ModelId) -> bool {
        let removed = self.models.write().remove(id);
        match removed {
            Some(handle) => {
                handle.release();
                debug!(model_id = %id, "Unregistered model");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ModelId) -> Option<Arc<ModelHandle>> {
        self.models.read().get(id).cloned()
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.models.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<ModelId> {
        self.models.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every model and empty the registry
    pub fn release_all(&self) {
        let drained: Vec<Arc<ModelHandle>> = {
            let mut models = self.models.write();
            models.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &drained {
            handle.release();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Released all models");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoModel {
        shape: Vec<usize>,
        releases: Arc<AtomicUsize>,
    }

    impl LoadedModel for EchoModel {
        fn input_shape(&self) -> &[usize] {
            &self.shape
        }
        fn output_shape(&self) -> &[usize] {
            &self.shape
        }
        fn device(&self) -> ExecutionDevice {
            ExecutionDevice::Cpu
        }
        fn run(&self, input: &Payload) -> Result<Payload> {
            Ok(input.clone())
        }
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct EchoLoader {
        releases: Arc<AtomicUsize>,
    }

    impl ModelLoader for EchoLoader {
        fn load(&self, path: &Path, _device: ExecutionDevice) -> Result<Box<dyn LoadedModel>> {
            if path.to_string_lossy().contains("missing") {
                return Err(crate::ExecutorError::model_load(
                    path.display().to_string(),
                    "not found",
                ));
            }
            Ok(Box::new(EchoModel {
                shape: vec![2, 3],
                releases: self.releases.clone(),
            }))
        }
    }

    fn registry() -> (ModelRegistry, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(EchoLoader { releases: releases.clone() });
        (ModelRegistry::new(loader), releases)
    }

    #[test]
    fn test_register_and_lookup() {
        let (registry, _) = registry();
        let id = registry
            .register_model("echo", "/models/echo.bin", ExecutionDevice::Auto)
            .unwrap();

        assert!(registry.contains(&id));
        let handle = registry.get(&id).unwrap();
        assert_eq!(handle.name(), "echo");
        assert_eq!(handle.input_elements(), 6);
        assert_eq!(handle.output_elements(), 6);
        assert_eq!(handle.device(), ExecutionDevice::Cpu);
    }

    #[test]
    fn test_failed_load_registers_nothing() {
        let (registry, _) = registry();
        let result = registry.register_model("x", "/models/missing.bin", ExecutionDevice::Cpu);
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_releases_once() {
        let (registry, releases) = registry();
        let id = registry
            .register_model("echo", "/models/echo.bin", ExecutionDevice::Cpu)
            .unwrap();
        let handle = registry.get(&id).unwrap();

        assert!(registry.unregister_model(&id));
        assert!(!registry.unregister_model(&id));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(handle.is_released());
        assert!(handle.run(&Payload::zeros(6)).is_err());
    }

    #[test]
    fn test_release_all() {
        let (registry, releases) = registry();
        for i in 0..3 {
            registry
                .register_model(&format!("m{}", i), "/models/echo.bin", ExecutionDevice::Cpu)
                .unwrap();
        }
        registry.release_all();
        assert!(registry.is_empty());
        assert_eq!(releases.load(Ordering::SeqCst), 3);

        registry.release_all();
        assert_eq!(releases.load(Ordering::SeqCst), 3);
    }
}
