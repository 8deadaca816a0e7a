mod backend;
mod backends;
mod registry;
mod result;

use std::path::Path;

use anyhow::Result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{MotionBackend, ThresholdBackend};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, BoxLimits, Detection, DetectionResult, ObjectClass};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;

/// Build the backends compiled into this binary.
///
/// `threshold` and `motion` are always present. `tract` is registered only when
/// the `backend-tract` feature is enabled and a model path is configured.
pub fn standard_backends(model_path: Option<&Path>, width: u32, height: u32) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(ThresholdBackend::default());
    registry.register(MotionBackend::default());

    #[cfg(feature = "backend-tract")]
    if let Some(path) = model_path {
        let mut tract = TractBackend::new(path, width, height)?;
        tract.warm_up()?;
        registry.register(tract);
    }
    #[cfg(not(feature = "backend-tract"))]
    if let Some(path) = model_path {
        log::warn!(
            "model {} ignored for {}x{} frames: built without backend-tract",
            path.display(),
            width,
            height
        );
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_backends_always_include_builtin_detectors() {
        let registry = standard_backends(None, 64, 48).unwrap();
        assert_eq!(registry.list(), vec!["motion", "threshold"]);
    }
}
