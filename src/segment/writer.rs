use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::StageError;
use crate::frame::Frame;
use crate::registry::{LeaseKeeper, Stage, StageOutcome, UnitRegistry};
use crate::segment::format::{fingerprint, FrameCodec, SegmentFile};
use crate::storage::{captured_key, ObjectStore};
use crate::{frame_interval_us, NewWorkUnit, TimeWindow};

#[derive(Clone, Debug)]
pub struct SegmentWriterConfig {
    pub event_id: String,
    pub segment_duration: Duration,
    pub frame_rate: f64,
    pub lease: Duration,
    pub codec: FrameCodec,
}

/// A segment that reached storage and the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct WrittenSegment {
    pub unit_id: String,
    pub location: String,
    pub frame_count: u32,
    pub window: TimeWindow,
}

struct OpenSegment {
    unit_id: String,
    start_us: i64,
    width: u32,
    height: u32,
    frames: Vec<Frame>,
    keeper: LeaseKeeper,
}

/// Buffers frames into fixed-duration segments (the capture stage).
///
/// A unit is registered and claimed for capture when its first frame arrives,
/// so the registry shows it `CAPTURING` while frames accumulate. The segment is
/// written to storage before the claim completes; a failed write marks the unit
/// `FAILED` and capture continues with the next segment.
pub struct SegmentWriter {
    registry: Arc<dyn UnitRegistry>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
    worker_id: String,
    config: SegmentWriterConfig,
    open: Option<OpenSegment>,
    next_start_us: Option<i64>,
    sequence: u32,
}

impl SegmentWriter {
    pub fn new(
        registry: Arc<dyn UnitRegistry>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        shutdown: Arc<AtomicBool>,
        worker_id: impl Into<String>,
        config: SegmentWriterConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            shutdown,
            worker_id: worker_id.into(),
            config,
            open: None,
            next_start_us: None,
            sequence: 0,
        }
    }

    fn duration_us(&self) -> i64 {
        i64::try_from(self.config.segment_duration.as_micros()).unwrap_or(i64::MAX / 4)
    }

    /// Add a frame; returns the previous segment when this frame closed it.
    pub fn push(&mut self, frame: Frame) -> Result<Option<WrittenSegment>, StageError> {
        let boundary = self.open.as_ref().map(|open| {
            let end = open.start_us + self.duration_us();
            let resized = open.width != frame.width || open.height != frame.height;
            (end, resized)
        });
        let flushed = match boundary {
            Some((end, _)) if frame.timestamp_us >= end => Some(self.close_open(end)),
            Some((end, true)) => Some(self.close_open(frame.timestamp_us.min(end))),
            _ => None,
        };

        if self.open.is_none() {
            self.open_segment(&frame)?;
        }
        if let Some(open) = self.open.as_mut() {
            match open.keeper.checkpoint() {
                Ok(()) => open.frames.push(frame),
                // The caller decides how to end the segment on shutdown.
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(err) => {
                    // The claim is gone (renewal refused), so nothing buffered
                    // can ever be completed.
                    if let Some(lost) = self.open.take() {
                        log::error!(
                            "SegmentWriter: lost capture claim on {} with {} buffered frames: {}",
                            lost.unit_id,
                            lost.frames.len(),
                            err
                        );
                    }
                    return Err(err);
                }
            }
        }
        flushed.transpose()
    }

    /// Flush the final, possibly short, segment at end of stream.
    pub fn finish(&mut self) -> Result<Option<WrittenSegment>, StageError> {
        let Some(open) = self.open.as_ref() else {
            return Ok(None);
        };
        let interval = frame_interval_us(self.config.frame_rate);
        let last_ts = open
            .frames
            .last()
            .map(|f| f.timestamp_us)
            .unwrap_or(open.start_us);
        let end = (last_ts + interval).min(open.start_us + self.duration_us());
        self.close_open(end).map(Some)
    }

    /// End the in-flight segment as `FAILED` with `reason` instead of storing it.
    ///
    /// A capture cannot be resumed by another worker, so a segment that will
    /// never be written is failed right away rather than left `CAPTURING`.
    pub fn fail_open(&mut self, reason: &str) -> Result<(), StageError> {
        let Some(open) = self.open.take() else {
            return Ok(());
        };
        log::warn!(
            "SegmentWriter: dropping {} with {} buffered frames: {}",
            open.unit_id,
            open.frames.len(),
            reason
        );
        self.registry.fail(&open.keeper.into_claim(), reason)?;
        Ok(())
    }

    fn open_segment(&mut self, first: &Frame) -> Result<(), StageError> {
        let duration_us = self.duration_us();
        let start_us = match self.next_start_us {
            Some(next) if first.timestamp_us >= next && first.timestamp_us < next + duration_us => {
                next
            }
            _ => first.timestamp_us,
        };
        self.sequence = self.sequence.wrapping_add(1);
        let unit_id = format!(
            "{}-{:013}-{:04}",
            self.config.event_id,
            start_us.div_euclid(1_000),
            self.sequence % 10_000
        );
        self.registry.create_pending(&NewWorkUnit {
            id: unit_id.clone(),
            event_id: self.config.event_id.clone(),
            start_us,
            duration_us,
            frame_rate: self.config.frame_rate,
        })?;
        let claim = self.registry.claim(
            &unit_id,
            Stage::Capture,
            &self.worker_id,
            self.config.lease,
        )?;
        self.open = Some(OpenSegment {
            unit_id,
            start_us,
            width: first.width,
            height: first.height,
            frames: Vec::new(),
            keeper: LeaseKeeper::new(
                self.registry.clone(),
                self.clock.clone(),
                self.shutdown.clone(),
                claim,
                self.config.lease,
            ),
        });
        Ok(())
    }

    fn close_open(&mut self, end_us: i64) -> Result<WrittenSegment, StageError> {
        let open = self
            .open
            .take()
            .ok_or_else(|| StageError::StorageUnavailable("no open segment".to_string()))?;
        self.next_start_us = Some(end_us);

        let duration_us = (end_us - open.start_us).max(1);
        let frame_count = open.frames.len() as u32;
        let claim = open.keeper.into_claim();
        let segment = SegmentFile {
            width: open.width,
            height: open.height,
            frame_rate: self.config.frame_rate,
            start_us: open.start_us,
            duration_us,
            partial: false,
            codec: self.config.codec,
            frames: open.frames,
        };
        let key = captured_key(&self.config.event_id, &open.unit_id);
        let stored = segment
            .encode()
            .map_err(|e| StageError::CorruptSegment {
                location: key.clone(),
                reason: format!("{e:#}"),
            })
            .and_then(|bytes| {
                let location = self.store.put(&key, &bytes).map_err(StageError::storage)?;
                Ok((location, fingerprint(&bytes)))
            });

        match stored {
            Ok((location, digest)) => {
                self.registry.complete(
                    &claim,
                    &StageOutcome::Captured {
                        location: location.clone(),
                        frame_count,
                        duration_us,
                    },
                )?;
                log::info!(
                    "SegmentWriter: wrote {} ({} frames, {} ms, sha256 {}) to {}",
                    open.unit_id,
                    frame_count,
                    duration_us / 1_000,
                    digest,
                    location
                );
                Ok(WrittenSegment {
                    unit_id: open.unit_id,
                    location,
                    frame_count,
                    window: TimeWindow::new(open.start_us, open.start_us + duration_us),
                })
            }
            Err(err) => {
                self.registry.fail(&claim, &err.to_string())?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::RegistryError;
    use crate::registry::{RegistryOptions, SqliteRegistry, UnitState};
    use crate::storage::InMemoryObjectStore;

    struct Harness {
        clock: Arc<ManualClock>,
        registry: Arc<SqliteRegistry>,
        store: Arc<InMemoryObjectStore>,
        writer: SegmentWriter,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let registry = Arc::new(
            SqliteRegistry::open_with_clock(
                &crate::shared_memory_uri(),
                RegistryOptions::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        let store = Arc::new(InMemoryObjectStore::new());
        let writer = SegmentWriter::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            Arc::new(AtomicBool::new(false)),
            "cap-1",
            SegmentWriterConfig {
                event_id: "race".into(),
                segment_duration: Duration::from_secs(1),
                frame_rate: 10.0,
                lease: Duration::from_secs(300),
                codec: FrameCodec::Raw,
            },
        );
        Harness {
            clock,
            registry,
            store,
            writer,
        }
    }

    fn frame(i: u64) -> Frame {
        Frame::new(i, 10_000_000 + i as i64 * 100_000, 2, 2, vec![0; 12]).unwrap()
    }

    #[test]
    fn segments_close_on_duration_and_stay_contiguous() {
        let mut h = harness();
        let mut written = Vec::new();
        for i in 0..25 {
            if let Some(seg) = h.writer.push(frame(i)).unwrap() {
                written.push(seg);
            }
        }
        written.extend(h.writer.finish().unwrap());

        assert_eq!(written.len(), 3);
        assert_eq!(written[0].frame_count, 10);
        assert_eq!(written[0].window, TimeWindow::new(10_000_000, 11_000_000));
        assert_eq!(written[1].window.start_us, written[0].window.end_us);
        assert_eq!(written[2].frame_count, 5);
        assert_eq!(written[2].window, TimeWindow::new(12_000_000, 12_500_000));

        for seg in &written {
            let unit = h.registry.get(&seg.unit_id).unwrap();
            assert_eq!(unit.state, UnitState::Captured);
            assert_eq!(unit.location.as_deref(), Some(seg.location.as_str()));
            assert_eq!(unit.duration_us, seg.window.duration_us());
        }
        assert_eq!(h.store.keys().len(), 3);
    }

    #[test]
    fn open_segment_is_capturing() {
        let mut h = harness();
        h.writer.push(frame(0)).unwrap();
        let units = h.registry.list(None, 10).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].state, UnitState::Capturing);
        assert_eq!(units[0].owner.as_deref(), Some("cap-1"));
        assert_eq!(units[0].id, "race-0000000010000-0001");
    }

    #[test]
    fn storage_outage_fails_the_unit_and_capture_continues() {
        let mut h = harness();
        for i in 0..10 {
            h.writer.push(frame(i)).unwrap();
        }
        h.store.set_available(false);
        let err = h.writer.push(frame(10)).expect_err("write fails");
        assert!(matches!(err, StageError::StorageUnavailable(_)));

        let failed = h.registry.list(Some(UnitState::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_stage, Some(Stage::Capture));
        assert!(failed[0].failure_reason.is_some());

        h.store.set_available(true);
        let next = h.writer.finish().unwrap().expect("second segment");
        assert_eq!(next.frame_count, 1);
    }

    #[test]
    fn dropped_segment_is_failed_with_its_reason() {
        let mut h = harness();
        h.writer.push(frame(0)).unwrap();
        h.writer.fail_open("camera went away").unwrap();
        assert!(h.writer.finish().unwrap().is_none());
        assert!(h.writer.fail_open("nothing open").is_ok());

        assert!(h.registry.list(Some(UnitState::Capturing), 10).unwrap().is_empty());
        let failed = h.registry.list(Some(UnitState::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_stage, Some(Stage::Capture));
        assert_eq!(failed[0].failure_reason.as_deref(), Some("camera went away"));
        assert!(h.store.keys().is_empty());
    }

    #[test]
    fn lost_claim_drops_the_open_segment() {
        let mut h = harness();
        h.writer.push(frame(0)).unwrap();
        h.clock.advance_secs(301);
        h.registry.fail_expired_captures().unwrap();

        let err = h.writer.push(frame(1)).expect_err("claim is gone");
        assert!(matches!(err, StageError::Registry(RegistryError::StaleClaim { .. })));
        // The next frame starts a fresh unit.
        h.writer.push(frame(2)).unwrap();
        assert_eq!(h.registry.list(Some(UnitState::Capturing), 10).unwrap().len(), 1);
        assert_eq!(h.registry.list(Some(UnitState::Failed), 10).unwrap().len(), 1);
    }
}
