use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Result of running detection on a frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    /// Did the frame change enough to count as motion?
    pub motion_detected: bool,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    /// Detections of `class` that clear the confidence floor and the box limits.
    pub fn qualifying<'a>(
        &'a self,
        class: ObjectClass,
        min_confidence: f32,
        limits: &'a BoxLimits,
    ) -> impl Iterator<Item = &'a Detection> + 'a {
        self.detections.iter().filter(move |d| {
            d.class == class && d.confidence >= min_confidence && limits.accepts(&d.bbox)
        })
    }
}

/// Axis-aligned box in normalized (0..1) frame coordinates, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    pub fn centroid(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Middle of the bottom edge: where a runner's feet touch the ground.
    pub fn bottom_center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.bottom())
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class: ObjectClass,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Bicycle,
    Vehicle,
    Animal,
    Unknown,
}

impl ObjectClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Vehicle => "vehicle",
            ObjectClass::Animal => "animal",
            ObjectClass::Unknown => "unknown",
        }
    }

    /// Map a COCO class index (as emitted by YOLO models).
    pub fn from_coco(index: usize) -> Self {
        match index {
            0 => ObjectClass::Person,
            1 => ObjectClass::Bicycle,
            2 | 3 | 5 | 7 => ObjectClass::Vehicle,
            14..=23 => ObjectClass::Animal,
            _ => ObjectClass::Unknown,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(ObjectClass::Person),
            "bicycle" => Ok(ObjectClass::Bicycle),
            "vehicle" => Ok(ObjectClass::Vehicle),
            "animal" => Ok(ObjectClass::Animal),
            "unknown" => Ok(ObjectClass::Unknown),
            other => Err(anyhow!("unknown object class `{other}`")),
        }
    }
}

/// Plausibility limits for detection boxes, in normalized units.
///
/// Small boxes touching the right or bottom edge are usually a body cut off by
/// the frame and are dropped; boxes covering most of the frame are dropped as
/// well.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoxLimits {
    pub min_edge_size: f32,
    pub edge_margin: f32,
    pub max_size: f32,
}

impl Default for BoxLimits {
    fn default() -> Self {
        Self {
            min_edge_size: 0.08,
            edge_margin: 0.02,
            max_size: 0.9,
        }
    }
}

impl BoxLimits {
    pub fn accepts(&self, bbox: &BoundingBox) -> bool {
        let small = bbox.w < self.min_edge_size || bbox.h < self.min_edge_size;
        let at_edge =
            bbox.right() > 1.0 - self.edge_margin || bbox.bottom() > 1.0 - self.edge_margin;
        if small && at_edge {
            return false;
        }
        bbox.w <= self.max_size && bbox.h <= self.max_size
    }
}
