//! Worker modes.
//!
//! One binary runs as any of the pipeline roles. The roles never talk to each
//! other: each polls the registry for units its stage can claim, and the
//! registry's claim contract is the only coordination between processes.

mod assemble;
mod capture;
mod detect;
mod filter;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::detect::{standard_backends, BackendRegistry, DetectorBackend, SharedBackend};
use crate::error::{RegistryError, StageError};
use crate::ingest::StreamSource;
use crate::registry::{Claim, LeaseKeeper, SqliteRegistry, Stage, StageOutcome, UnitRegistry};
use crate::storage::{open_object_store, ObjectStore};

pub use assemble::AssembleWorker;
pub use capture::{CaptureSummary, CaptureWorker};
pub use detect::DetectWorker;
pub use filter::FilterWorker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkerMode {
    Capture,
    Filter,
    Detect,
    Assemble,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerMode::Capture => "capture",
            WorkerMode::Filter => "filter",
            WorkerMode::Detect => "detect",
            WorkerMode::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

/// Shared handles for one worker process.
pub struct WorkerContext {
    pub registry: Arc<dyn UnitRegistry>,
    pub store: Arc<dyn ObjectStore>,
    pub detectors: Arc<BackendRegistry>,
    pub config: PipelineConfig,
    pub worker_id: String,
    pub clock: Arc<dyn Clock>,
    pub shutdown: Arc<AtomicBool>,
}

impl WorkerContext {
    /// Open the registry, object store and detector backends named by `config`.
    pub fn open(config: PipelineConfig, worker_id: String, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let registry = SqliteRegistry::open(&config.db_path, config.registry_options())?;
        let store = open_object_store(&config.storage)?;
        let detectors = standard_backends(
            config.detect.model_path.as_deref(),
            config.capture.width,
            config.capture.height,
        )?;
        log::info!(
            "worker {}: registry {}, storage {}, detectors [{}]",
            worker_id,
            config.db_path,
            store.describe(),
            detectors.list().join(", ")
        );
        Ok(Self {
            registry: Arc::new(registry),
            store,
            detectors: Arc::new(detectors),
            config,
            worker_id,
            clock: Arc::new(SystemClock),
            shutdown,
        })
    }

    pub fn lease(&self) -> Duration {
        self.config.worker.lease
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn keeper(&self, claim: Claim) -> LeaseKeeper {
        LeaseKeeper::new(
            self.registry.clone(),
            self.clock.clone(),
            self.shutdown.clone(),
            claim,
            self.lease(),
        )
    }

    /// Sleep for the poll interval, waking early on shutdown.
    fn idle(&self) {
        let step = Duration::from_millis(100);
        let mut remaining = self.config.worker.poll_interval;
        while !remaining.is_zero() && !self.shutdown_requested() {
            let nap = remaining.min(step);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }
}

/// Result of one poll of a stage worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was claimable.
    Idle,
    Completed,
    /// The unit was marked `FAILED`.
    Failed,
    /// Shutdown interrupted the unit; its lease will expire.
    Abandoned,
}

/// A stage that processes one claimable unit per step.
pub trait StageWorker {
    fn stage(&self) -> Stage;

    fn step(&mut self, ctx: &WorkerContext) -> Result<StepOutcome, RegistryError>;
}

/// Resolve a claim from the stage result.
///
/// Infrastructure failures become `fail`, shutdown leaves the claim to expire,
/// and registry errors are returned to the caller untouched.
pub(crate) fn settle(
    ctx: &WorkerContext,
    keeper: LeaseKeeper,
    result: Result<StageOutcome, StageError>,
) -> Result<StepOutcome, RegistryError> {
    let claim = keeper.into_claim();
    match result {
        Ok(outcome) => {
            let unit = ctx.registry.complete(&claim, &outcome)?;
            log::info!(
                "worker {}: {} {} -> {}",
                ctx.worker_id,
                claim.stage,
                unit.id,
                unit.state
            );
            Ok(StepOutcome::Completed)
        }
        Err(err) if err.is_recordable() => {
            log::error!(
                "worker {}: {} of {} failed: {}",
                ctx.worker_id,
                claim.stage,
                claim.unit_id,
                err
            );
            ctx.registry.fail(&claim, &err.to_string())?;
            Ok(StepOutcome::Failed)
        }
        Err(StageError::Registry(err)) => Err(err),
        // Only `Cancelled` is left: the lease runs out and the unit is retried.
        Err(_) => {
            log::warn!(
                "worker {}: shutdown during {} of {}, claim abandoned",
                ctx.worker_id,
                claim.stage,
                claim.unit_id
            );
            Ok(StepOutcome::Abandoned)
        }
    }
}

/// Poll `worker` until shutdown.
///
/// Contract violations are logged and the loop moves on to the next unit; any
/// other registry error stops the worker.
pub fn run_loop(ctx: &WorkerContext, worker: &mut dyn StageWorker) -> Result<()> {
    log::info!("worker {}: polling for {} work", ctx.worker_id, worker.stage());
    while !ctx.shutdown_requested() {
        match worker.step(ctx) {
            Ok(StepOutcome::Idle) => {
                fail_stranded_captures(ctx)?;
                ctx.idle();
            }
            Ok(_) => {}
            Err(err) if err.is_contract_violation() => {
                log::error!(
                    "worker {}: registry contract violation during {}: {}",
                    ctx.worker_id,
                    worker.stage(),
                    err
                );
            }
            Err(err) => {
                return Err(anyhow!(err).context(format!("{} worker stopped", worker.stage())));
            }
        }
    }
    log::info!("worker {}: shutdown, leaving {} loop", ctx.worker_id, worker.stage());
    Ok(())
}

/// A capture process that died leaves its unit `CAPTURING`; any idle worker
/// moves such units to `FAILED` once their lease has run out.
fn fail_stranded_captures(ctx: &WorkerContext) -> Result<()> {
    let failed = ctx
        .registry
        .fail_expired_captures()
        .map_err(|err| anyhow!(err).context("sweeping expired capture leases"))?;
    for unit in failed {
        log::warn!(
            "worker {}: {} was stranded in CAPTURING and is now FAILED",
            ctx.worker_id,
            unit.id
        );
    }
    Ok(())
}

/// Run the selected mode until shutdown (or end of stream for capture).
pub fn run(ctx: &WorkerContext, mode: WorkerMode) -> Result<()> {
    match mode {
        WorkerMode::Capture => {
            let source = StreamSource::new(ctx.config.stream_config())?;
            let summary = CaptureWorker::new(source).run(ctx)?;
            log::info!(
                "worker {}: capture finished, {} frames, {} segments written, {} failed",
                ctx.worker_id,
                summary.frames,
                summary.segments,
                summary.failed
            );
            Ok(())
        }
        WorkerMode::Filter => run_loop(ctx, &mut FilterWorker::from_context(ctx)?),
        WorkerMode::Detect => run_loop(ctx, &mut DetectWorker::from_context(ctx)?),
        WorkerMode::Assemble => run_loop(ctx, &mut AssembleWorker::from_context(ctx)),
    }
}

pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "host".to_string());
    format!(
        "{}-{}-{}",
        host,
        std::process::id(),
        hex::encode(rand::random::<[u8; 2]>())
    )
}

pub(crate) fn lock_backend(
    backend: &SharedBackend,
) -> Result<MutexGuard<'_, dyn DetectorBackend + 'static>, StageError> {
    backend
        .lock()
        .map_err(|_| StageError::DetectorUnavailable("detector backend lock poisoned".to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UnitState;
    use crate::NewWorkUnit;

    fn unit(id: &str) -> NewWorkUnit {
        NewWorkUnit {
            id: id.into(),
            event_id: "race".into(),
            start_us: 0,
            duration_us: 1_000_000,
            frame_rate: 10.0,
        }
    }

    #[test]
    fn settle_records_infrastructure_failures() {
        let t = testing::context(PipelineConfig::default());
        t.ctx.registry.register_captured(&unit("u1"), "missing").unwrap();
        let claim = t
            .ctx
            .registry
            .claim("u1", Stage::Filter, "test-worker", t.ctx.lease())
            .unwrap();
        let outcome = settle(
            &t.ctx,
            t.ctx.keeper(claim),
            Err(StageError::StorageUnavailable("bucket offline".into())),
        )
        .unwrap();
        assert_eq!(outcome, StepOutcome::Failed);
        let failed = t.ctx.registry.get("u1").unwrap();
        assert_eq!(failed.state, UnitState::Failed);
        assert_eq!(failed.failed_stage, Some(Stage::Filter));
        assert!(failed.failure_reason.unwrap().contains("bucket offline"));
    }

    #[test]
    fn settle_abandons_on_shutdown() {
        let t = testing::context(PipelineConfig::default());
        t.ctx.registry.register_captured(&unit("u1"), "loc").unwrap();
        let claim = t
            .ctx
            .registry
            .claim("u1", Stage::Filter, "test-worker", t.ctx.lease())
            .unwrap();
        let outcome = settle(&t.ctx, t.ctx.keeper(claim), Err(StageError::Cancelled)).unwrap();
        assert_eq!(outcome, StepOutcome::Abandoned);
        assert_eq!(t.ctx.registry.get("u1").unwrap().state, UnitState::Filtering);
    }

    #[test]
    fn idle_workers_fail_stranded_captures() {
        let t = testing::context(PipelineConfig::default());
        t.ctx.registry.create_pending(&unit("u1")).unwrap();
        t.ctx
            .registry
            .claim("u1", Stage::Capture, "cap-gone", t.ctx.lease())
            .unwrap();

        fail_stranded_captures(&t.ctx).unwrap();
        assert_eq!(t.ctx.registry.get("u1").unwrap().state, UnitState::Capturing);

        t.clock.advance_secs(t.ctx.lease().as_secs() as i64 + 1);
        fail_stranded_captures(&t.ctx).unwrap();
        let unit = t.ctx.registry.get("u1").unwrap();
        assert_eq!(unit.state, UnitState::Failed);
        assert_eq!(unit.failed_stage, Some(Stage::Capture));
    }

    #[test]
    fn worker_ids_are_unique_per_call() {
        let a = default_worker_id();
        let pid = std::process::id().to_string();
        assert!(a.contains(&pid));
        assert_eq!(a.rsplit('-').next().unwrap().len(), 4);
    }
}
