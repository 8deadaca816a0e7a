//! Work unit registry: the shared state machine every worker coordinates through.

mod lease;
mod sqlite;
mod state;

use std::time::Duration;

use serde::Serialize;

use crate::error::RegistryError;
use crate::{Clip, CrossingEvent, NewWorkUnit, WorkUnit};

pub use lease::LeaseKeeper;
pub use sqlite::SqliteRegistry;
pub use state::{ParseStateError, Stage, StageOutcome, UnitState};

/// Exclusive, time-bounded hold on a unit for one stage.
///
/// The token identifies this particular claim: a worker whose lease expired and
/// was reclaimed by someone else still holds the old token and is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub unit_id: String,
    pub stage: Stage,
    pub worker_id: String,
    pub token: String,
    pub lease_expires_us: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryOptions {
    pub filter_enabled: bool,
    /// Failures after which a unit stays `FAILED` for good.
    pub max_retries: u32,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            filter_enabled: true,
            max_retries: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjacency {
    Before,
    After,
}

/// What an external caller sees when polling a unit.
#[derive(Clone, Debug, Serialize)]
pub struct UnitStatus {
    pub unit: WorkUnit,
    pub events: Vec<CrossingEvent>,
    pub clips: Vec<Clip>,
}

/// One persisted state change.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateTransition {
    pub unit_id: String,
    pub from: Option<UnitState>,
    pub to: UnitState,
    pub stage: Option<Stage>,
    pub worker_id: Option<String>,
    pub at_us: i64,
}

/// A crossing event with its position in the downstream polling feed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventRecord {
    pub seq: i64,
    pub event: CrossingEvent,
}

/// Registry persistence contract.
///
/// Implementations must make `claim`, `complete` and `fail` atomic with respect
/// to every other process sharing the registry.
pub trait UnitRegistry: Send + Sync {
    fn options(&self) -> RegistryOptions;

    /// Create a unit in `PENDING`; the capture stage claims it next.
    fn create_pending(&self, unit: &NewWorkUnit) -> Result<WorkUnit, RegistryError>;

    /// Create a unit directly in `CAPTURED` for segments that landed in storage
    /// without going through the capture stage.
    fn register_captured(
        &self,
        unit: &NewWorkUnit,
        location: &str,
    ) -> Result<WorkUnit, RegistryError>;

    fn claim(
        &self,
        unit_id: &str,
        stage: Stage,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Claim, RegistryError>;

    /// Claim the oldest unit that is claimable for `stage`, if any.
    fn claim_next(
        &self,
        stage: Stage,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Claim>, RegistryError>;

    /// Extend a live claim. Fails with `StaleClaim` once the lease has lapsed.
    fn renew(&self, claim: &mut Claim, lease: Duration) -> Result<(), RegistryError>;

    fn complete(&self, claim: &Claim, outcome: &StageOutcome) -> Result<WorkUnit, RegistryError>;

    fn fail(&self, claim: &Claim, reason: &str) -> Result<WorkUnit, RegistryError>;

    /// Explicit retry reset: move a `FAILED` unit back to its stage predecessor.
    fn requeue_failed(&self, unit_id: &str) -> Result<WorkUnit, RegistryError>;

    /// Move `CAPTURING` units whose lease lapsed to `FAILED`.
    ///
    /// Nobody else can resume a capture claim, so an expired one means the
    /// capture process died or stalled with the segment unwritten.
    fn fail_expired_captures(&self) -> Result<Vec<WorkUnit>, RegistryError>;

    fn get(&self, unit_id: &str) -> Result<WorkUnit, RegistryError>;

    fn list(&self, state: Option<UnitState>, limit: usize) -> Result<Vec<WorkUnit>, RegistryError>;

    /// Contiguous neighbour of `unit` within the same event.
    fn adjacent(
        &self,
        unit: &WorkUnit,
        side: Adjacency,
    ) -> Result<Option<WorkUnit>, RegistryError>;

    fn events_for_unit(&self, unit_id: &str) -> Result<Vec<CrossingEvent>, RegistryError>;

    fn clips_for_unit(&self, unit_id: &str) -> Result<Vec<Clip>, RegistryError>;

    fn event(&self, event_id: &str) -> Result<Option<CrossingEvent>, RegistryError>;

    /// Events recorded after `cursor`, oldest first.
    fn events_since(&self, cursor: i64, limit: usize) -> Result<Vec<EventRecord>, RegistryError>;

    fn history(&self, unit_id: &str) -> Result<Vec<StateTransition>, RegistryError>;

    fn status(&self, unit_id: &str) -> Result<UnitStatus, RegistryError> {
        let unit = self.get(unit_id)?;
        let events = self.events_for_unit(unit_id)?;
        let clips = self.clips_for_unit(unit_id)?;
        Ok(UnitStatus {
            unit,
            events,
            clips,
        })
    }

    fn counts(&self) -> Result<Vec<(UnitState, u64)>, RegistryError>;
}
