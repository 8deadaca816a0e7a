use anyhow::{anyhow, Result};

use crate::detect::{DetectionCapability, SharedBackend};
use crate::error::{RegistryError, StageError};
use crate::filter::MotionFilter;
use crate::registry::{LeaseKeeper, Stage, StageOutcome};
use crate::segment::load_segment;

use super::{lock_backend, settle, StageWorker, StepOutcome, WorkerContext};

/// Filter mode: claim `CAPTURED` units and either discard them or trim them
/// to the window with qualifying motion.
pub struct FilterWorker {
    filter: MotionFilter,
    backend: SharedBackend,
}

impl FilterWorker {
    pub fn from_context(ctx: &WorkerContext) -> Result<Self> {
        if !ctx.config.filter.enabled {
            return Err(anyhow!(
                "filter mode requested but filtering is disabled (filter.enabled = false)"
            ));
        }
        let name = &ctx.config.filter.backend;
        let backend = ctx
            .detectors
            .require(name, DetectionCapability::ObjectDetection)
            .or_else(|_| ctx.detectors.require(name, DetectionCapability::Motion))?;
        Ok(Self {
            filter: MotionFilter::new(ctx.config.filter_config()),
            backend,
        })
    }

    fn evaluate(&self, ctx: &WorkerContext, keeper: &mut LeaseKeeper) -> Result<StageOutcome, StageError> {
        let unit = ctx.registry.get(&keeper.claim().unit_id)?;
        let segment = load_segment(ctx.store.as_ref(), &unit)?;
        let mut backend = lock_backend(&self.backend)?;
        let verdict = self.filter.evaluate(
            &unit,
            &segment.frames,
            &mut *backend,
            &mut || keeper.checkpoint(),
        )?;
        Ok(verdict.into_outcome())
    }
}

impl StageWorker for FilterWorker {
    fn stage(&self) -> Stage {
        Stage::Filter
    }

    fn step(&mut self, ctx: &WorkerContext) -> Result<StepOutcome, RegistryError> {
        let Some(claim) = ctx
            .registry
            .claim_next(Stage::Filter, &ctx.worker_id, ctx.lease())?
        else {
            return Ok(StepOutcome::Idle);
        };
        let mut keeper = ctx.keeper(claim);
        let result = self.evaluate(ctx, &mut keeper);
        settle(ctx, keeper, result)
    }
}
