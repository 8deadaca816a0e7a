use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use super::geometry::{LineSegment, Point};
use super::tracker::{Observation, Track, Tracker};
use crate::detect::{BoundingBox, BoxLimits, DetectorBackend, ObjectClass};
use crate::error::StageError;
use crate::frame::Frame;
use crate::{CrossingDirection, CrossingEvent, WorkUnit};

/// Which point of a detection box is tracked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPoint {
    #[default]
    Centroid,
    /// Middle of the bottom edge, where the feet meet the ground.
    BottomCenter,
}

impl AnchorPoint {
    fn locate(self, bbox: &BoundingBox, width: u32, height: u32) -> Point {
        let (x, y) = match self {
            AnchorPoint::Centroid => bbox.centroid(),
            AnchorPoint::BottomCenter => bbox.bottom_center(),
        };
        Point::new(x as f64 * width as f64, y as f64 * height as f64)
    }
}

impl FromStr for AnchorPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "centroid" => Ok(AnchorPoint::Centroid),
            "bottom_center" | "bottom-center" | "foot" => Ok(AnchorPoint::BottomCenter),
            other => Err(anyhow!("unknown anchor point `{other}`")),
        }
    }
}

/// Crossing directions of interest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionFilter {
    #[default]
    Forward,
    Reverse,
    Both,
}

impl DirectionFilter {
    pub fn accepts(self, direction: CrossingDirection) -> bool {
        matches!(
            (self, direction),
            (DirectionFilter::Both, _)
                | (DirectionFilter::Forward, CrossingDirection::Forward)
                | (DirectionFilter::Reverse, CrossingDirection::Reverse)
        )
    }

    /// Is a point with this side value already past the line?
    ///
    /// `Both` treats the positive side as the finish side.
    fn past_line(self, side: f64) -> bool {
        match self {
            DirectionFilter::Forward | DirectionFilter::Both => side >= 0.0,
            DirectionFilter::Reverse => side <= 0.0,
        }
    }
}

impl FromStr for DirectionFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(DirectionFilter::Forward),
            "reverse" => Ok(DirectionFilter::Reverse),
            "both" => Ok(DirectionFilter::Both),
            other => Err(anyhow!("unknown crossing direction `{other}`")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CrossingConfig {
    /// Trigger line as normalised `[x1, y1, x2, y2]`.
    pub line: [f64; 4],
    pub direction: DirectionFilter,
    pub anchor: AnchorPoint,
    pub class: ObjectClass,
    pub min_confidence: f32,
    pub box_limits: BoxLimits,
    pub max_match_distance_px: f64,
    pub track_timeout_frames: u32,
    pub cooldown_us: i64,
}

impl Default for CrossingConfig {
    fn default() -> Self {
        Self {
            line: [0.5, 0.0, 0.5, 1.0],
            direction: DirectionFilter::Forward,
            anchor: AnchorPoint::Centroid,
            class: ObjectClass::Person,
            min_confidence: 0.6,
            box_limits: BoxLimits::default(),
            max_match_distance_px: 80.0,
            track_timeout_frames: 5,
            cooldown_us: 1_000_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryEdge {
    First,
    Last,
}

impl fmt::Display for BoundaryEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryEdge::First => f.write_str("first"),
            BoundaryEdge::Last => f.write_str("last"),
        }
    }
}

/// A track seen already past the line at the first or last analysed frame.
///
/// There is no observed "before" position, so no crossing is reported for it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BoundaryObservation {
    pub track_id: u64,
    pub frame_index: u64,
    pub timestamp_us: i64,
    pub edge: BoundaryEdge,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrossingReport {
    /// Ordered by crossing time, then track id.
    pub events: Vec<CrossingEvent>,
    pub ambiguous: Vec<BoundaryObservation>,
    pub frames_analyzed: usize,
    pub tracks_seen: u64,
}

struct Candidate {
    crossing_time_us: i64,
    track_id: u64,
    direction: CrossingDirection,
    confidence: f32,
    frame_index: u64,
}

pub struct CrossingDetector {
    config: CrossingConfig,
}

impl CrossingDetector {
    pub fn new(config: CrossingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CrossingConfig {
        &self.config
    }

    /// One detection pass over the unit's analysis window.
    pub fn run(
        &self,
        unit: &WorkUnit,
        frames: &[Frame],
        backend: &mut dyn DetectorBackend,
        checkpoint: &mut dyn FnMut() -> Result<(), StageError>,
    ) -> Result<CrossingReport, StageError> {
        let window = unit.analysis_window();
        let analyzed: Vec<&Frame> = frames
            .iter()
            .filter(|f| window.contains(f.timestamp_us))
            .collect();
        let mut report = CrossingReport {
            frames_analyzed: analyzed.len(),
            ..Default::default()
        };
        let (Some(first), Some(last)) = (analyzed.first(), analyzed.last()) else {
            log::info!("CrossingDetector: {} has no frames in its analysis window", unit.id);
            return Ok(report);
        };
        let (first_index, last_index) = (first.index, last.index);

        backend.reset();
        let cfg = &self.config;
        let mut tracker = Tracker::new(cfg.max_match_distance_px, cfg.track_timeout_frames);
        let mut candidates = Vec::new();
        let mut boundary: BTreeMap<u64, BoundaryObservation> = BTreeMap::new();
        let mut crossed: HashSet<u64> = HashSet::new();

        for frame in &analyzed {
            checkpoint()?;
            let line = LineSegment::from_normalized(cfg.line, frame.width, frame.height);
            let result = backend
                .detect(frame.pixels(), frame.width, frame.height)
                .map_err(StageError::detector)?;
            let observations: Vec<Observation> = result
                .qualifying(cfg.class, cfg.min_confidence, &cfg.box_limits)
                .map(|d| Observation {
                    anchor: cfg.anchor.locate(&d.bbox, frame.width, frame.height),
                    confidence: d.confidence,
                })
                .collect();

            let update = tracker.update(frame.index, frame.timestamp_us, &observations);
            report.tracks_seen += update.created.len() as u64;

            let edge = if frame.index == first_index {
                Some(BoundaryEdge::First)
            } else if frame.index == last_index {
                Some(BoundaryEdge::Last)
            } else {
                None
            };
            if let Some(edge) = edge {
                for id in &update.created {
                    let Some(point) = tracker.get(*id).and_then(Track::last) else {
                        continue;
                    };
                    if cfg.direction.past_line(line.side(&point.anchor)) {
                        boundary.insert(
                            *id,
                            BoundaryObservation {
                                track_id: *id,
                                frame_index: frame.index,
                                timestamp_us: frame.timestamp_us,
                                edge,
                            },
                        );
                    }
                }
            }

            for id in &update.extended {
                let Some(track) = tracker.get_mut(*id) else {
                    continue;
                };
                let Some(candidate) = self.step_crossing(&line, track) else {
                    continue;
                };
                crossed.insert(*id);
                candidates.push(candidate);
            }
        }
        tracker.drain();

        candidates.sort_by(|a, b| {
            a.crossing_time_us
                .cmp(&b.crossing_time_us)
                .then(a.track_id.cmp(&b.track_id))
        });
        report.events = candidates
            .into_iter()
            .enumerate()
            .map(|(i, c)| CrossingEvent {
                id: format!("{}-x{:03}", unit.id, i),
                unit_id: unit.id.clone(),
                crossing_time_us: c.crossing_time_us,
                track_id: c.track_id,
                direction: c.direction,
                confidence: c.confidence,
                frame_index: c.frame_index,
            })
            .collect();

        report.ambiguous = boundary
            .into_values()
            .filter(|obs| !crossed.contains(&obs.track_id))
            .collect();
        for obs in &report.ambiguous {
            log::warn!(
                "CrossingDetector: AmbiguousBoundaryCrossing in {}: track {} already past the line at the {} frame ({}), not reported",
                unit.id,
                obs.track_id,
                obs.edge,
                obs.frame_index
            );
        }
        log::info!(
            "CrossingDetector: {} analysed {} frames, {} tracks, {} crossings",
            unit.id,
            report.frames_analyzed,
            report.tracks_seen,
            report.events.len()
        );
        Ok(report)
    }

    /// Test the track's latest step against the line, honouring the direction
    /// filter and the per-track cooldown.
    fn step_crossing(&self, line: &LineSegment, track: &mut Track) -> Option<Candidate> {
        let (prev, cur) = track.last_step()?;
        let hit = line.crossing(&prev.anchor, &cur.anchor)?;
        if !self.config.direction.accepts(hit.direction) {
            return None;
        }
        let span = (cur.timestamp_us - prev.timestamp_us) as f64;
        let crossing_time_us = prev.timestamp_us + (hit.fraction * span).round() as i64;
        let candidate = Candidate {
            crossing_time_us,
            track_id: track.id,
            direction: hit.direction,
            confidence: prev.confidence.min(cur.confidence),
            frame_index: cur.frame_index,
        };
        if let Some(last) = track.last_emitted_us {
            if crossing_time_us - last < self.config.cooldown_us {
                log::debug!(
                    "CrossingDetector: track {} re-crossed within cooldown, suppressed",
                    track.id
                );
                return None;
            }
        }
        track.last_emitted_us = Some(crossing_time_us);
        Some(candidate)
    }
}
