use anyhow::Result;

use crate::crossing::CrossingDetector;
use crate::detect::{DetectionCapability, SharedBackend};
use crate::error::{RegistryError, StageError};
use crate::registry::{LeaseKeeper, Stage, StageOutcome};
use crate::segment::{load_segment, SegmentFile};

use super::{lock_backend, settle, AssembleWorker, StageWorker, StepOutcome, WorkerContext};

/// Detect mode: run the crossing detector over claimable units.
///
/// With `worker.assemble_after_detect` the same process claims the assemble
/// stage right after a successful detect and reuses the decoded segment.
pub struct DetectWorker {
    detector: CrossingDetector,
    backend: SharedBackend,
    assembler: Option<AssembleWorker>,
}

impl DetectWorker {
    pub fn from_context(ctx: &WorkerContext) -> Result<Self> {
        let backend = ctx
            .detectors
            .require(&ctx.config.detect.backend, DetectionCapability::ObjectDetection)?;
        let assembler = ctx
            .config
            .worker
            .assemble_after_detect
            .then(|| AssembleWorker::from_context(ctx));
        Ok(Self {
            detector: CrossingDetector::new(ctx.config.crossing_config()),
            backend,
            assembler,
        })
    }

    fn detect(
        &self,
        ctx: &WorkerContext,
        keeper: &mut LeaseKeeper,
        loaded: &mut Option<SegmentFile>,
    ) -> Result<StageOutcome, StageError> {
        let unit = ctx.registry.get(&keeper.claim().unit_id)?;
        let segment = load_segment(ctx.store.as_ref(), &unit)?;
        let report = {
            let mut backend = lock_backend(&self.backend)?;
            self.detector
                .run(&unit, &segment.frames, &mut *backend, &mut || keeper.checkpoint())?
        };
        log::info!(
            "worker {}: {} analyzed {} frames, {} tracks, {} crossings, {} ambiguous at boundaries",
            ctx.worker_id,
            unit.id,
            report.frames_analyzed,
            report.tracks_seen,
            report.events.len(),
            report.ambiguous.len()
        );
        *loaded = Some(segment);
        Ok(StageOutcome::Detected {
            events: report.events,
        })
    }
}

impl StageWorker for DetectWorker {
    fn stage(&self) -> Stage {
        Stage::Detect
    }

    fn step(&mut self, ctx: &WorkerContext) -> Result<StepOutcome, RegistryError> {
        let Some(claim) = ctx
            .registry
            .claim_next(Stage::Detect, &ctx.worker_id, ctx.lease())?
        else {
            return Ok(StepOutcome::Idle);
        };
        let unit_id = claim.unit_id.clone();
        let mut keeper = ctx.keeper(claim);
        let mut loaded = None;
        let result = self.detect(ctx, &mut keeper, &mut loaded);
        let outcome = settle(ctx, keeper, result)?;
        if outcome == StepOutcome::Completed && !ctx.shutdown_requested() {
            if let Some(assembler) = &self.assembler {
                assembler.assemble_unit(ctx, &unit_id, loaded)?;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::ingest::{StreamConfig, SyntheticScene};
    use crate::registry::UnitState;
    use crate::segment::FrameCodec;
    use crate::storage::{captured_key, ObjectStore};
    use crate::worker::testing;
    use crate::NewWorkUnit;

    const SEC: i64 = 1_000_000;

    fn config(assemble_after_detect: bool) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.filter.enabled = false;
        config.worker.assemble_after_detect = assemble_after_detect;
        config
    }

    /// Store a 5 s scene with one runner crossing the middle at 2 s.
    fn store_scene(t: &testing::TestContext, id: &str) {
        let mut scene = SyntheticScene::new(StreamConfig {
            url: "stub://t?duration=5&runner=0:4&start=0&pace=0".to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        })
        .unwrap();
        scene.connect().unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = scene.next_frame().unwrap() {
            frames.push(frame);
        }
        let segment = SegmentFile {
            width: 64,
            height: 48,
            frame_rate: 10.0,
            start_us: 0,
            duration_us: 5 * SEC,
            partial: false,
            codec: FrameCodec::Raw,
            frames,
        };
        let location = t
            .store
            .put(&captured_key("race", id), &segment.encode().unwrap())
            .unwrap();
        t.ctx
            .registry
            .register_captured(
                &NewWorkUnit {
                    id: id.into(),
                    event_id: "race".into(),
                    start_us: 0,
                    duration_us: 5 * SEC,
                    frame_rate: 10.0,
                },
                &location,
            )
            .unwrap();
    }

    #[test]
    fn records_the_crossing_and_leaves_assembly_to_the_next_stage() {
        let t = testing::context(config(false));
        store_scene(&t, "u1");
        let mut worker = DetectWorker::from_context(&t.ctx).unwrap();
        assert_eq!(worker.step(&t.ctx).unwrap(), StepOutcome::Completed);

        let status = t.ctx.registry.status("u1").unwrap();
        assert_eq!(status.unit.state, UnitState::Detected);
        assert_eq!(status.events.len(), 1);
        let crossing = &status.events[0];
        assert!((crossing.crossing_time_us - 2 * SEC).abs() <= SEC / 5);
        assert_eq!(crossing.direction, crate::CrossingDirection::Forward);
        assert!(status.clips.is_empty());

        let mut assembler = AssembleWorker::from_context(&t.ctx);
        assert_eq!(assembler.step(&t.ctx).unwrap(), StepOutcome::Completed);
        assert_eq!(t.ctx.registry.clips_for_unit("u1").unwrap().len(), 1);
    }

    #[test]
    fn inline_assembly_finishes_the_unit() {
        let t = testing::context(config(true));
        store_scene(&t, "u1");
        let mut worker = DetectWorker::from_context(&t.ctx).unwrap();
        assert_eq!(worker.step(&t.ctx).unwrap(), StepOutcome::Completed);

        let status = t.ctx.registry.status("u1").unwrap();
        assert_eq!(status.unit.state, UnitState::Done);
        assert_eq!(status.clips.len(), 1);
        let clip = &status.clips[0];
        assert_eq!(clip.crossing_id, status.events[0].id);
        // Default 5 s lead and trail cannot be covered by a lone 5 s unit.
        assert!(clip.partial);
        assert_eq!((clip.start_us, clip.end_us), (0, 5 * SEC));
        assert!(t.store.get(&clip.location).is_ok());
    }

    #[test]
    fn empty_units_complete_without_events() {
        let t = testing::context(config(true));
        let segment = SegmentFile {
            width: 4,
            height: 4,
            frame_rate: 10.0,
            start_us: 0,
            duration_us: SEC,
            partial: false,
            codec: FrameCodec::Raw,
            frames: Vec::new(),
        };
        let location = t
            .store
            .put(&captured_key("race", "quiet"), &segment.encode().unwrap())
            .unwrap();
        t.ctx
            .registry
            .register_captured(
                &NewWorkUnit {
                    id: "quiet".into(),
                    event_id: "race".into(),
                    start_us: 0,
                    duration_us: SEC,
                    frame_rate: 10.0,
                },
                &location,
            )
            .unwrap();
        let mut worker = DetectWorker::from_context(&t.ctx).unwrap();
        assert_eq!(worker.step(&t.ctx).unwrap(), StepOutcome::Completed);
        let status = t.ctx.registry.status("quiet").unwrap();
        assert_eq!(status.unit.state, UnitState::Done);
        assert!(status.events.is_empty());
        assert!(status.clips.is_empty());
    }
}
