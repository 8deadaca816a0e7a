use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ObjectClass};
use crate::frame::rgb_len;

/// Bright-foreground blob detector.
///
/// Pixels brighter than `luma_threshold` are grouped into 4-connected
/// components; each component large enough becomes one detection of the
/// configured class. Works for high-contrast setups (bibs under IR light) and
/// for the synthetic `stub://` scenes.
pub struct ThresholdBackend {
    pub luma_threshold: u8,
    pub min_pixels: usize,
    pub class: ObjectClass,
    pub confidence: f32,
}

impl Default for ThresholdBackend {
    fn default() -> Self {
        Self {
            luma_threshold: 128,
            min_pixels: 4,
            class: ObjectClass::Person,
            confidence: 0.9,
        }
    }
}

impl DetectorBackend for ThresholdBackend {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
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
        let (w, h) = (width as usize, height as usize);
        let mut foreground: Vec<bool> = pixels
            .chunks_exact(3)
            .map(|px| luma(px[0], px[1], px[2]) > self.luma_threshold)
            .collect();

        let mut detections = Vec::new();
        let mut stack = Vec::new();
        for start in 0..foreground.len() {
            if !foreground[start] {
                continue;
            }
            foreground[start] = false;
            stack.push(start);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0usize, 0usize);
            let mut count = 0usize;
            while let Some(idx) = stack.pop() {
                let (x, y) = (idx % w, idx / w);
                count += 1;
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
                let mut visit = |n: usize| {
                    if foreground[n] {
                        foreground[n] = false;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(idx - 1);
                }
                if x + 1 < w {
                    visit(idx + 1);
                }
                if y > 0 {
                    visit(idx - w);
                }
                if y + 1 < h {
                    visit(idx + w);
                }
            }
            if count < self.min_pixels {
                continue;
            }
            let box_w = max_x - min_x + 1;
            let box_h = max_y - min_y + 1;
            let fill = count as f32 / (box_w * box_h) as f32;
            detections.push(Detection {
                bbox: BoundingBox {
                    x: min_x as f32 / width as f32,
                    y: min_y as f32 / height as f32,
                    w: box_w as f32 / width as f32,
                    h: box_h as f32 / height as f32,
                },
                confidence: (self.confidence * fill).clamp(0.0, 1.0),
                class: self.class,
            });
        }

        Ok(DetectionResult {
            motion_detected: !detections.is_empty(),
            detections,
        })
    }
}

pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8
}
