//! Clip assembly: cut one clip per crossing event, borrowing frames from the
//! contiguous neighbour when the clip window crosses a segment boundary.

use std::sync::Arc;

use crate::error::StageError;
use crate::frame::Frame;
use crate::registry::{Adjacency, UnitRegistry};
use crate::segment::{load_segment, SegmentFile};
use crate::storage::{clip_key, ObjectStore};
use crate::{Clip, CrossingEvent, TimeWindow, WorkUnit};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipConfig {
    pub lead_us: i64,
    pub trail_us: i64,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            lead_us: 5_000_000,
            trail_us: 5_000_000,
        }
    }
}

pub struct ClipAssembler {
    config: ClipConfig,
    store: Arc<dyn ObjectStore>,
    registry: Arc<dyn UnitRegistry>,
}

impl ClipAssembler {
    pub fn new(
        config: ClipConfig,
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn UnitRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
        }
    }

    /// Write one clip per event and return their records, in event order.
    ///
    /// Clip objects are in storage when this returns; the caller records them
    /// through `complete`.
    pub fn assemble(
        &self,
        unit: &WorkUnit,
        segment: &SegmentFile,
        events: &[CrossingEvent],
        checkpoint: &mut dyn FnMut() -> Result<(), StageError>,
    ) -> Result<Vec<Clip>, StageError> {
        let mut before: Option<Option<SegmentFile>> = None;
        let mut after: Option<Option<SegmentFile>> = None;
        let mut clips = Vec::with_capacity(events.len());

        for event in events {
            checkpoint()?;
            let requested = TimeWindow::new(
                event.crossing_time_us.saturating_sub(self.config.lead_us),
                event.crossing_time_us.saturating_add(self.config.trail_us),
            );
            let own = unit.window();
            let mut covered = own;
            let mut frames: Vec<Frame> = segment.frames_in(requested).cloned().collect();

            if requested.start_us < own.start_us {
                if before.is_none() {
                    before = Some(self.neighbour(unit, segment, Adjacency::Before)?);
                }
                if let Some(Some(prev)) = &before {
                    covered.start_us = prev.start_us;
                    frames.extend(prev.frames_in(requested).cloned());
                }
            }
            if requested.end_us > own.end_us {
                if after.is_none() {
                    after = Some(self.neighbour(unit, segment, Adjacency::After)?);
                }
                if let Some(Some(next)) = &after {
                    covered.end_us = next.window().end_us;
                    frames.extend(next.frames_in(requested).cloned());
                }
            }

            let Some(window) = requested.intersect(&covered) else {
                log::warn!(
                    "ClipAssembler: crossing {} lies outside {}, no clip cut",
                    event.id,
                    unit.id
                );
                continue;
            };
            let partial = window != requested;
            frames.sort_by_key(|f| f.timestamp_us);
            frames.dedup_by_key(|f| f.timestamp_us);
            frames.retain(|f| window.contains(f.timestamp_us));

            clips.push(self.write_clip(unit, segment, event, window, partial, frames)?);
        }
        Ok(clips)
    }

    /// Load the contiguous neighbour's segment, `None` when it is missing,
    /// not captured yet, unreadable or of a different frame size.
    fn neighbour(
        &self,
        unit: &WorkUnit,
        segment: &SegmentFile,
        side: Adjacency,
    ) -> Result<Option<SegmentFile>, StageError> {
        let Some(other) = self.registry.adjacent(unit, side)? else {
            log::info!("ClipAssembler: {} has no contiguous neighbour {:?}", unit.id, side);
            return Ok(None);
        };
        if !other.has_segment() {
            log::info!(
                "ClipAssembler: neighbour {} of {} is not captured yet ({})",
                other.id,
                unit.id,
                other.state
            );
            return Ok(None);
        }
        match load_segment(self.store.as_ref(), &other) {
            Ok(file) if file.width == segment.width && file.height == segment.height => {
                Ok(Some(file))
            }
            Ok(file) => {
                log::warn!(
                    "ClipAssembler: neighbour {} is {}x{}, {} is {}x{}; not joined",
                    other.id,
                    file.width,
                    file.height,
                    unit.id,
                    segment.width,
                    segment.height
                );
                Ok(None)
            }
            Err(StageError::CorruptSegment { location, reason }) => {
                log::warn!(
                    "ClipAssembler: neighbour segment {} unreadable: {}",
                    location,
                    reason
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn write_clip(
        &self,
        unit: &WorkUnit,
        segment: &SegmentFile,
        event: &CrossingEvent,
        window: TimeWindow,
        partial: bool,
        frames: Vec<Frame>,
    ) -> Result<Clip, StageError> {
        let id = format!("{}-clip", event.id);
        let frame_count = frames.len() as u32;
        let file = SegmentFile {
            width: segment.width,
            height: segment.height,
            frame_rate: segment.frame_rate,
            start_us: window.start_us,
            duration_us: window.duration_us(),
            partial,
            codec: segment.codec,
            frames,
        };
        let key = clip_key(&unit.event_id, &id);
        let bytes = file.encode().map_err(|e| StageError::CorruptSegment {
            location: key.clone(),
            reason: format!("{e:#}"),
        })?;
        let location = self.store.put(&key, &bytes).map_err(StageError::storage)?;
        if partial {
            log::warn!(
                "ClipAssembler: clip {} truncated to {}..{} ({} frames)",
                id,
                window.start_us,
                window.end_us,
                frame_count
            );
        } else {
            log::info!("ClipAssembler: clip {} written ({} frames)", id, frame_count);
        }

        Ok(Clip {
            id,
            crossing_id: event.id.clone(),
            unit_id: unit.id.clone(),
            start_us: window.start_us,
            end_us: window.end_us,
            location,
            frame_count,
            partial,
        })
    }
}
