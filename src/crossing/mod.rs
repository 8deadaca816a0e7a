//! Crossing detection: per-unit object tracking and sub-frame line-crossing
//! estimation.
//!
//! Known boundary limitation: a track first seen at the first or last analysed
//! frame of a unit, already on the finish side of the line, has no observed
//! position before the line. It is reported as a `BoundaryObservation` and
//! never as a crossing.

mod detector;
pub mod geometry;
mod tracker;

pub use detector::{
    AnchorPoint, BoundaryEdge, BoundaryObservation, CrossingConfig, CrossingDetector,
    CrossingReport, DirectionFilter,
};
pub use geometry::{LineCrossing, LineSegment, Point};
pub use tracker::{Observation, Track, TrackPoint, TrackUpdate, Tracker};
