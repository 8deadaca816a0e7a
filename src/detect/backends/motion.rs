use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::backends::threshold::luma;
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ObjectClass};
use crate::frame::rgb_len;

/// Frame-differencing motion heuristic.
///
/// Compares each frame with the previous one on luma; a frame is in motion when
/// the share of pixels that changed by more than `pixel_delta` reaches
/// `min_changed_fraction`. The changed region is reported as one `Unknown`
/// detection. The first frame after `reset` never reports motion.
pub struct MotionBackend {
    pub pixel_delta: u8,
    pub min_changed_fraction: f32,
    previous: Option<Vec<u8>>,
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self {
            pixel_delta: 25,
            min_changed_fraction: 0.002,
            previous: None,
        }
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Motion)
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        if pixels.len() != rgb_len(width, height)? {
            return Err(anyhow!(
                "expected {}x{} RGB frame, received {} bytes",
                width,
                height,
                pixels.len()
            ));
        }
        let current: Vec<u8> = pixels
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect();
        let previous = self.previous.replace(current);
        let (Some(previous), Some(current)) = (previous, self.previous.as_ref()) else {
            return Ok(DetectionResult::default());
        };
        if previous.len() != current.len() {
            return Ok(DetectionResult::default());
        }

        let w = width as usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);
        let mut changed = 0usize;
        for (idx, (a, b)) in previous.iter().zip(current.iter()).enumerate() {
            if a.abs_diff(*b) > self.pixel_delta {
                changed += 1;
                let (x, y) = (idx % w, idx / w);
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }
        let fraction = changed as f32 / current.len().max(1) as f32;
        if changed == 0 || fraction < self.min_changed_fraction {
            return Ok(DetectionResult::default());
        }

        Ok(DetectionResult {
            motion_detected: true,
            detections: vec![Detection {
                bbox: BoundingBox {
                    x: min_x as f32 / width as f32,
                    y: min_y as f32 / height as f32,
                    w: (max_x - min_x + 1) as f32 / width as f32,
                    h: (max_y - min_y + 1) as f32 / height as f32,
                },
                confidence: (fraction / self.min_changed_fraction).min(1.0),
                class: ObjectClass::Unknown,
            }],
        })
    }

    fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_requires_a_changed_frame() {
        let mut backend = MotionBackend::default();
        let still = vec![50u8; 8 * 8 * 3];
        let mut moved = still.clone();
        moved[..12].fill(200);

        assert!(!backend.detect(&still, 8, 8).unwrap().motion_detected);
        assert!(!backend.detect(&still, 8, 8).unwrap().motion_detected);
        let result = backend.detect(&moved, 8, 8).unwrap();
        assert!(result.motion_detected);
        assert_eq!(result.detections[0].class, ObjectClass::Unknown);
        assert!((result.detections[0].bbox.w - 0.5).abs() < 1e-6);
    }

    #[test]
    fn reset_forgets_previous_frame() {
        let mut backend = MotionBackend::default();
        backend.detect(&vec![0u8; 12], 2, 2).unwrap();
        backend.reset();
        assert!(!backend.detect(&vec![255u8; 12], 2, 2).unwrap().motion_detected);
    }
}
