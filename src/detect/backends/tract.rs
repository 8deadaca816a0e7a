#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection, DetectionResult, ObjectClass};
use crate::frame::rgb_len;

/// YOLOv8-style ONNX detector run through tract.
///
/// The model must take a `1x3xHxW` float input and produce `1x(4+C)xN`, with
/// rows `cx, cy, w, h` in input pixels followed by one score per COCO class.
/// Frames must already be at the model input size.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    score_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!(
            "TractBackend: loaded {} for {}x{} input",
            model_path.display(),
            width,
            height
        );

        Ok(Self {
            model,
            width,
            height,
            score_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    pub fn with_thresholds(mut self, score: f32, iou: f32) -> Self {
        self.score_threshold = score;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        if width != self.width || height != self.height {
            return Err(anyhow!(
                "frame size {}x{} does not match model input {}x{}",
                width,
                height,
                self.width,
                self.height
            ));
        }
        if pixels.len() != rgb_len(width, height)? {
            return Err(anyhow!(
                "expected {}x{} RGB frame, received {} bytes",
                width,
                height,
                pixels.len()
            ));
        }

        let w = width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, w),
            |(_, channel, y, x)| pixels[(y * w + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let (in_w, in_h) = (self.width as f32, self.height as f32);

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for class in 0..rows - 4 {
                let score = view[[0, 4 + class, i]];
                if score > best.1 {
                    best = (class, score);
                }
            }
            if best.1 < self.score_threshold {
                continue;
            }
            let (cx, cy) = (view[[0, 0, i]], view[[0, 1, i]]);
            let (bw, bh) = (view[[0, 2, i]], view[[0, 3, i]]);
            let x1 = ((cx - bw / 2.0) / in_w).clamp(0.0, 1.0);
            let y1 = ((cy - bh / 2.0) / in_h).clamp(0.0, 1.0);
            let x2 = ((cx + bw / 2.0) / in_w).clamp(0.0, 1.0);
            let y2 = ((cy + bh / 2.0) / in_h).clamp(0.0, 1.0);
            candidates.push(Detection {
                bbox: BoundingBox::from_corners(x1, y1, x2, y2),
                confidence: best.1.min(1.0),
                class: ObjectClass::from_coco(best.0),
            });
        }
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Greedy NMS per class, highest confidence first.
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept.iter().any(|k| {
            k.class == candidate.class && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode(outputs)?;
        Ok(DetectionResult {
            motion_detected: !detections.is_empty(),
            detections,
        })
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = vec![0u8; rgb_len(self.width, self.height)?];
        self.detect(&blank, self.width, self.height).map(|_| ())
    }
}
