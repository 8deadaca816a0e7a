//! Error taxonomy shared by the registry and the pipeline stages.
//!
//! Registry contract violations (`AlreadyClaimed`, `InvalidState`, `StaleClaim`,
//! `ConflictingOutcome`) indicate a race or a programming bug and are always
//! surfaced. Infrastructure failures (`DetectorUnavailable`,
//! `StorageUnavailable`) are recorded against the unit with `fail` and retried
//! up to the configured ceiling.

use thiserror::Error;

use crate::registry::{Stage, UnitState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("work unit {0} not found")]
    NotFound(String),

    #[error("work unit {0} already exists")]
    DuplicateUnit(String),

    #[error("invalid work unit: {0}")]
    InvalidUnit(String),

    #[error("work unit {unit_id} is already claimed by {owner}")]
    AlreadyClaimed { unit_id: String, owner: String },

    #[error("work unit {unit_id} is {actual}, stage {stage} expects {expected}")]
    InvalidState {
        unit_id: String,
        stage: Stage,
        expected: UnitState,
        actual: UnitState,
    },

    #[error("stale claim on work unit {unit_id} for stage {stage}")]
    StaleClaim { unit_id: String, stage: Stage },

    #[error("conflicting outcome for work unit {unit_id} at stage {stage}")]
    ConflictingOutcome { unit_id: String, stage: Stage },

    #[error("outcome `{outcome}` cannot complete stage {stage}")]
    MismatchedOutcome { stage: Stage, outcome: &'static str },

    #[error("stage {0} is disabled in this registry")]
    StageDisabled(Stage),

    #[error("work unit {unit_id} is {actual}, only FAILED units can be requeued")]
    NotFailed { unit_id: String, actual: UnitState },

    #[error("work unit {unit_id} reached the retry ceiling ({retries} failures)")]
    RetryCeilingExceeded { unit_id: String, retries: u32 },

    #[error("work unit {unit_id} failed at stage {stage}, which cannot be retried")]
    NotRetryable { unit_id: String, stage: Stage },

    #[error("work unit {unit_id} cannot move from {from} to {to}")]
    IllegalTransition {
        unit_id: String,
        from: &'static str,
        to: UnitState,
    },

    #[error("corrupt registry row: {0}")]
    Corrupt(String),

    #[error("registry connection lock poisoned")]
    LockPoisoned,

    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("registry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RegistryError {
    /// Errors caused by callers racing or misusing the claim protocol.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            RegistryError::AlreadyClaimed { .. }
                | RegistryError::InvalidState { .. }
                | RegistryError::StaleClaim { .. }
                | RegistryError::ConflictingOutcome { .. }
                | RegistryError::MismatchedOutcome { .. }
                | RegistryError::StageDisabled(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("corrupt segment at {location}: {reason}")]
    CorruptSegment { location: String, reason: String },

    /// Shutdown was requested while the claim was in flight.
    #[error("stage cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StageError {
    /// Failures that are recorded against the unit via `fail`.
    pub fn is_recordable(&self) -> bool {
        matches!(
            self,
            StageError::DetectorUnavailable(_)
                | StageError::StorageUnavailable(_)
                | StageError::CorruptSegment { .. }
        )
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        StageError::StorageUnavailable(format!("{err:#}"))
    }

    pub(crate) fn detector(err: anyhow::Error) -> Self {
        StageError::DetectorUnavailable(format!("{err:#}"))
    }
}
