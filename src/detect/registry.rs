use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorBackend};

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Named detector backends available to a worker.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, SharedBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name, replacing any previous one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Look up a configured backend and check it can serve `capability`.
    pub fn require(&self, name: &str, capability: DetectionCapability) -> Result<SharedBackend> {
        let backend = self.get(name).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })?;
        let supports = backend
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?
            .supports(capability);
        if !supports {
            return Err(anyhow!(
                "detector backend '{}' does not support {:?}",
                name,
                capability
            ));
        }
        Ok(backend)
    }

    /// First backend, by name order, that supports `capability`.
    pub fn backend_for_capability(&self, capability: DetectionCapability) -> Result<SharedBackend> {
        for backend in self.backends.values() {
            let supports = backend
                .lock()
                .map_err(|_| anyhow!("backend lock poisoned"))?
                .supports(capability);
            if supports {
                return Ok(backend.clone());
            }
        }
        Err(anyhow!(
            "no registered backend supports capability {:?}",
            capability
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{MotionBackend, ThresholdBackend};

    #[test]
    fn require_checks_name_and_capability() {
        let mut registry = BackendRegistry::new();
        registry.register(ThresholdBackend::default());
        registry.register(MotionBackend::default());

        assert!(registry
            .require("threshold", DetectionCapability::ObjectDetection)
            .is_ok());
        assert!(registry
            .require("motion", DetectionCapability::ObjectDetection)
            .is_err());
        let err = registry
            .require("yolo", DetectionCapability::ObjectDetection)
            .err()
            .expect("missing backend");
        assert!(err.to_string().contains("motion, threshold"));
    }

    #[test]
    fn capability_lookup_finds_motion_backend() {
        let mut registry = BackendRegistry::new();
        registry.register(MotionBackend::default());
        let backend = registry
            .backend_for_capability(DetectionCapability::Motion)
            .unwrap();
        assert_eq!(backend.lock().unwrap().name(), "motion");
    }
}
