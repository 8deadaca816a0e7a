use anyhow::Result;

use crate::detect::result::DetectionResult;

/// Detection capabilities supported by backends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// Frame-to-frame change only; cheap enough for the motion filter.
    Motion,
    /// Classified bounding boxes.
    ObjectDetection,
}

/// Detector backend trait.
///
/// A backend maps one RGB24 frame to detections. The pipeline treats it as a
/// pure function of the frame: any state a backend keeps between calls (a
/// previous frame for differencing, a loaded model) must not change which
/// objects it reports for a given frame sequence, and `reset` is called before
/// each unit so state never leaks across segments.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult>;

    /// Forget per-stream state before a new unit is analyzed.
    fn reset(&mut self) {}

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
