use crate::clip::ClipAssembler;
use crate::error::{RegistryError, StageError};
use crate::registry::{Claim, LeaseKeeper, Stage, StageOutcome};
use crate::segment::{load_segment, SegmentFile};

use super::{settle, StageWorker, StepOutcome, WorkerContext};

/// Assemble mode: cut clips for `DETECTED` units.
pub struct AssembleWorker {
    assembler: ClipAssembler,
}

impl AssembleWorker {
    pub fn from_context(ctx: &WorkerContext) -> Self {
        Self {
            assembler: ClipAssembler::new(
                ctx.config.clip_config(),
                ctx.store.clone(),
                ctx.registry.clone(),
            ),
        }
    }

    /// Claim and assemble one specific unit, reusing an already decoded segment.
    ///
    /// Losing the claim to another assembler is not an error here.
    pub(crate) fn assemble_unit(
        &self,
        ctx: &WorkerContext,
        unit_id: &str,
        segment: Option<SegmentFile>,
    ) -> Result<StepOutcome, RegistryError> {
        let claim = match ctx
            .registry
            .claim(unit_id, Stage::Assemble, &ctx.worker_id, ctx.lease())
        {
            Ok(claim) => claim,
            Err(err) if err.is_contract_violation() => {
                log::info!(
                    "worker {}: {} not assembled inline: {}",
                    ctx.worker_id,
                    unit_id,
                    err
                );
                return Ok(StepOutcome::Idle);
            }
            Err(err) => return Err(err),
        };
        self.assemble_claimed(ctx, claim, segment)
    }

    fn assemble_claimed(
        &self,
        ctx: &WorkerContext,
        claim: Claim,
        segment: Option<SegmentFile>,
    ) -> Result<StepOutcome, RegistryError> {
        let mut keeper = ctx.keeper(claim);
        let result = self.assemble(ctx, &mut keeper, segment);
        settle(ctx, keeper, result)
    }

    fn assemble(
        &self,
        ctx: &WorkerContext,
        keeper: &mut LeaseKeeper,
        segment: Option<SegmentFile>,
    ) -> Result<StageOutcome, StageError> {
        let unit = ctx.registry.get(&keeper.claim().unit_id)?;
        let events = ctx.registry.events_for_unit(&unit.id)?;
        if events.is_empty() {
            return Ok(StageOutcome::Assembled { clips: Vec::new() });
        }
        let segment = match segment {
            Some(segment) => segment,
            None => load_segment(ctx.store.as_ref(), &unit)?,
        };
        let clips = self
            .assembler
            .assemble(&unit, &segment, &events, &mut || keeper.checkpoint())?;
        Ok(StageOutcome::Assembled { clips })
    }
}

impl StageWorker for AssembleWorker {
    fn stage(&self) -> Stage {
        Stage::Assemble
    }

    fn step(&mut self, ctx: &WorkerContext) -> Result<StepOutcome, RegistryError> {
        match ctx
            .registry
            .claim_next(Stage::Assemble, &ctx.worker_id, ctx.lease())?
        {
            Some(claim) => self.assemble_claimed(ctx, claim, None),
            None => Ok(StepOutcome::Idle),
        }
    }
}
