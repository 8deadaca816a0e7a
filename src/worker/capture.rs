use anyhow::{anyhow, Context, Result};

use crate::error::StageError;
use crate::frame::FrameSource;
use crate::segment::{SegmentWriter, WrittenSegment};

use super::WorkerContext;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: u64,
    pub segments: u64,
    /// Segments marked `FAILED` because they could not be stored.
    pub failed: u64,
}

/// Capture mode: pull frames from a source and hand them to a `SegmentWriter`.
pub struct CaptureWorker<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> CaptureWorker<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Run until end of stream or shutdown.
    ///
    /// Whenever capture stops early (shutdown, or too many read errors in a
    /// row) the open segment is failed with the reason, never completed with a
    /// truncated frame set.
    pub fn run(&mut self, ctx: &WorkerContext) -> Result<CaptureSummary> {
        let stranded = ctx.registry.fail_expired_captures()?;
        if !stranded.is_empty() {
            log::warn!(
                "worker {}: failed {} segment(s) left CAPTURING by a previous capture",
                ctx.worker_id,
                stranded.len()
            );
        }
        self.source
            .connect()
            .with_context(|| format!("connecting to {}", self.source.describe()))?;
        let mut config = ctx.config.writer_config();
        config.frame_rate = self.source.frame_rate();
        let mut writer = SegmentWriter::new(
            ctx.registry.clone(),
            ctx.store.clone(),
            ctx.clock.clone(),
            ctx.shutdown.clone(),
            ctx.worker_id.clone(),
            config,
        );
        log::info!(
            "worker {}: capturing {} into {}s segments",
            ctx.worker_id,
            self.source.describe(),
            ctx.config.capture.segment_duration.as_secs_f64()
        );

        let max_errors = ctx.config.capture.max_consecutive_errors;
        let mut summary = CaptureSummary::default();
        let mut consecutive_errors = 0u32;

        loop {
            if ctx.shutdown_requested() {
                stop(&mut writer, SHUTDOWN_REASON)?;
                return Ok(summary);
            }
            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    frame
                }
                Ok(None) => break,
                Err(err) => {
                    consecutive_errors += 1;
                    log::warn!(
                        "worker {}: frame read failed ({}/{}): {:#}",
                        ctx.worker_id,
                        consecutive_errors,
                        max_errors,
                        err
                    );
                    if consecutive_errors >= max_errors {
                        let reason = format!(
                            "{} consecutive frame read errors from {}: {:#}",
                            consecutive_errors,
                            self.source.describe(),
                            err
                        );
                        stop(&mut writer, &reason)?;
                        return Err(anyhow!(reason));
                    }
                    continue;
                }
            };
            summary.frames += 1;
            let pushed = writer.push(frame);
            if !record(ctx, &mut summary, pushed)? {
                stop(&mut writer, SHUTDOWN_REASON)?;
                return Ok(summary);
            }
        }

        let finished = writer.finish();
        record(ctx, &mut summary, finished)?;
        Ok(summary)
    }
}

const SHUTDOWN_REASON: &str = "capture stopped by shutdown before the segment was complete";

fn stop(writer: &mut SegmentWriter, reason: &str) -> Result<()> {
    writer
        .fail_open(reason)
        .map_err(|err| anyhow!(err).context("recording the unfinished segment"))
}

/// Fold one writer result into `summary`. Returns false once shutdown cancelled
/// the open segment.
fn record(
    ctx: &WorkerContext,
    summary: &mut CaptureSummary,
    result: Result<Option<WrittenSegment>, StageError>,
) -> Result<bool> {
    match result {
        Ok(Some(_)) => summary.segments += 1,
        Ok(None) => {}
        Err(StageError::Cancelled) => return Ok(false),
        Err(StageError::Registry(err)) if err.is_contract_violation() => {
            log::error!(
                "worker {}: registry contract violation during capture: {}",
                ctx.worker_id,
                err
            );
        }
        Err(StageError::Registry(err)) => return Err(anyhow!(err).context("capture stopped")),
        Err(err) if err.is_recordable() => {
            summary.failed += 1;
            log::error!("worker {}: segment not stored: {}", ctx.worker_id, err);
        }
        Err(err) => return Err(anyhow!(err).context("capture stopped")),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::frame::Frame;
    use crate::registry::{Stage, UnitState};
    use crate::worker::testing;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Scripted source: `None` entries are read errors.
    struct Scripted {
        reads: VecDeque<Option<Frame>>,
    }

    impl Scripted {
        fn frames(count: u64, interval_us: i64) -> Self {
            Self {
                reads: (0..count)
                    .map(|i| Some(Frame::new(i, i as i64 * interval_us, 2, 2, vec![0; 12]).unwrap()))
                    .collect(),
            }
        }
    }

    impl FrameSource for Scripted {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            match self.reads.pop_front() {
                Some(Some(frame)) => Ok(Some(frame)),
                Some(None) => Err(anyhow!("decoder hiccup")),
                None => Ok(None),
            }
        }

        fn frame_rate(&self) -> f64 {
            10.0
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Raises the shutdown flag after `stop_after` frames.
    struct Interrupting {
        inner: Scripted,
        stop_after: u64,
        shutdown: Arc<AtomicBool>,
    }

    impl FrameSource for Interrupting {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            let frame = self.inner.next_frame()?;
            if frame.as_ref().is_some_and(|f| f.index + 1 >= self.stop_after) {
                self.shutdown.store(true, Ordering::SeqCst);
            }
            Ok(frame)
        }

        fn frame_rate(&self) -> f64 {
            10.0
        }

        fn describe(&self) -> String {
            "interrupting".to_string()
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.event_id = "race".to_string();
        config.capture.segment_duration = Duration::from_secs(1);
        config.capture.max_consecutive_errors = 3;
        config
    }

    #[test]
    fn end_of_stream_flushes_every_segment() {
        let t = testing::context(config());
        let summary = CaptureWorker::new(Scripted::frames(25, 100_000))
            .run(&t.ctx)
            .unwrap();
        assert_eq!(summary.frames, 25);
        assert_eq!(summary.segments, 3);
        let captured = t.ctx.registry.list(Some(UnitState::Captured), 10).unwrap();
        assert_eq!(captured.len(), 3);
        assert_eq!(t.store.keys().len(), 3);
    }

    #[test]
    fn storage_outage_fails_the_segment_and_continues() {
        let t = testing::context(config());
        t.store.set_available(false);
        let summary = CaptureWorker::new(Scripted::frames(15, 100_000))
            .run(&t.ctx)
            .unwrap();
        assert_eq!(summary.segments, 0);
        assert_eq!(summary.failed, 2);
        assert_eq!(t.ctx.registry.list(Some(UnitState::Failed), 10).unwrap().len(), 2);
    }

    #[test]
    fn gives_up_after_consecutive_read_errors() {
        let t = testing::context(config());
        let mut source = Scripted::frames(2, 100_000);
        source.reads.extend([None, None, None]);
        let err = CaptureWorker::new(source).run(&t.ctx).unwrap_err();
        assert!(err.to_string().contains("3 consecutive"));

        // Nothing is left CAPTURING, even long after the lease would have run out.
        t.clock.advance_secs(3600);
        assert!(t.ctx.registry.list(Some(UnitState::Capturing), 10).unwrap().is_empty());
        let failed = t.ctx.registry.list(Some(UnitState::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_stage, Some(Stage::Capture));
        assert!(failed[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("decoder hiccup"));
        assert!(t.store.keys().is_empty());
    }

    #[test]
    fn shutdown_before_first_frame_creates_nothing() {
        let t = testing::context(config());
        t.ctx.shutdown.store(true, Ordering::SeqCst);
        let summary = CaptureWorker::new(Scripted::frames(3, 100_000))
            .run(&t.ctx)
            .unwrap();
        assert_eq!(summary.frames, 0);
        assert!(t.ctx.registry.list(None, 10).unwrap().is_empty());
    }

    #[test]
    fn shutdown_mid_segment_leaves_a_failed_unit() {
        let t = testing::context(config());
        let source = Interrupting {
            inner: Scripted::frames(8, 100_000),
            stop_after: 5,
            shutdown: t.ctx.shutdown.clone(),
        };
        let summary = CaptureWorker::new(source).run(&t.ctx).unwrap();
        assert_eq!(summary.segments, 0);
        let failed = t.ctx.registry.list(Some(UnitState::Failed), 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some(SHUTDOWN_REASON));
        assert!(t.ctx.registry.list(Some(UnitState::Capturing), 10).unwrap().is_empty());
    }

    #[test]
    fn stranded_captures_are_failed_at_startup() {
        let t = testing::context(config());
        // Simulate a process that died mid-segment: claim by hand, never finish.
        t.ctx
            .registry
            .create_pending(&crate::NewWorkUnit {
                id: "race-orphan".into(),
                event_id: "race".into(),
                start_us: 0,
                duration_us: 1_000_000,
                frame_rate: 10.0,
            })
            .unwrap();
        t.ctx
            .registry
            .claim("race-orphan", Stage::Capture, "cap-crashed", t.ctx.lease())
            .unwrap();
        t.clock.advance_secs(t.ctx.lease().as_secs() as i64 + 1);

        CaptureWorker::new(Scripted::frames(5, 100_000))
            .run(&t.ctx)
            .unwrap();
        let orphan = t.ctx.registry.get("race-orphan").unwrap();
        assert_eq!(orphan.state, UnitState::Failed);
        assert!(orphan.failure_reason.unwrap().contains("cap-crashed"));
    }

    #[test]
    fn isolated_read_errors_are_tolerated() {
        let t = testing::context(config());
        let mut source = Scripted::frames(5, 100_000);
        source.reads.insert(2, None);
        source.reads.insert(4, None);
        let summary = CaptureWorker::new(source).run(&t.ctx).unwrap();
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.segments, 1);
    }
}
