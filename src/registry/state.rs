use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Clip, CrossingEvent, TimeWindow};

/// Lifecycle of a work unit.
///
/// `PENDING → CAPTURING → CAPTURED → FILTERING → FILTERED → DETECTING →
/// DETECTED → ASSEMBLING → DONE`, with `FAILED` reachable from every
/// in-progress state. The filter states are skipped when filtering is disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Pending,
    Capturing,
    Captured,
    Filtering,
    Filtered,
    Detecting,
    Detected,
    Assembling,
    Done,
    Failed,
}

impl UnitState {
    pub const ALL: [UnitState; 10] = [
        UnitState::Pending,
        UnitState::Capturing,
        UnitState::Captured,
        UnitState::Filtering,
        UnitState::Filtered,
        UnitState::Detecting,
        UnitState::Detected,
        UnitState::Assembling,
        UnitState::Done,
        UnitState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UnitState::Pending => "PENDING",
            UnitState::Capturing => "CAPTURING",
            UnitState::Captured => "CAPTURED",
            UnitState::Filtering => "FILTERING",
            UnitState::Filtered => "FILTERED",
            UnitState::Detecting => "DETECTING",
            UnitState::Detected => "DETECTED",
            UnitState::Assembling => "ASSEMBLING",
            UnitState::Done => "DONE",
            UnitState::Failed => "FAILED",
        }
    }

    /// Position in the pipeline order. `FAILED` sits outside the order.
    pub fn rank(self) -> Option<u8> {
        match self {
            UnitState::Failed => None,
            other => Some(other as u8),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Done | UnitState::Failed)
    }

    /// States in which a worker holds the unit under a lease.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            UnitState::Capturing
                | UnitState::Filtering
                | UnitState::Detecting
                | UnitState::Assembling
        )
    }

    /// Transitions the registry is allowed to persist outside of an explicit
    /// retry reset.
    pub fn can_advance_to(self, next: UnitState) -> bool {
        if next == UnitState::Failed {
            return self.is_in_progress();
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseStateError {
    kind: &'static str,
    value: String,
}

impl FromStr for UnitState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError {
                kind: "unit state",
                value: s.to_string(),
            })
    }
}

/// Pipeline stage that claims a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Capture,
    Filter,
    Detect,
    Assemble,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Capture, Stage::Filter, Stage::Detect, Stage::Assemble];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Filter => "filter",
            Stage::Detect => "detect",
            Stage::Assemble => "assemble",
        }
    }

    pub fn in_progress(self) -> UnitState {
        match self {
            Stage::Capture => UnitState::Capturing,
            Stage::Filter => UnitState::Filtering,
            Stage::Detect => UnitState::Detecting,
            Stage::Assemble => UnitState::Assembling,
        }
    }

    pub fn success(self) -> UnitState {
        match self {
            Stage::Capture => UnitState::Captured,
            Stage::Filter => UnitState::Filtered,
            Stage::Detect => UnitState::Detected,
            Stage::Assemble => UnitState::Done,
        }
    }

    /// State a unit must be in before this stage can claim it.
    pub fn predecessor(self, filter_enabled: bool) -> UnitState {
        match self {
            Stage::Capture => UnitState::Pending,
            Stage::Filter => UnitState::Captured,
            Stage::Detect if filter_enabled => UnitState::Filtered,
            Stage::Detect => UnitState::Captured,
            Stage::Assemble => UnitState::Detected,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStateError {
                kind: "stage",
                value: s.to_string(),
            })
    }
}

/// Data recorded when a stage completes.
///
/// The canonical JSON encoding of an outcome is what `complete` compares to
/// decide between an idempotent repeat and a conflicting one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutcome {
    Captured {
        location: String,
        frame_count: u32,
        duration_us: i64,
    },
    Filtered {
        window: TimeWindow,
        qualifying_fraction: f64,
    },
    /// Segment without qualifying motion. Terminal, not a failure.
    Discarded { qualifying_fraction: f64 },
    Detected { events: Vec<CrossingEvent> },
    Assembled { clips: Vec<Clip> },
}

impl StageOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutcome::Captured { .. } => Stage::Capture,
            StageOutcome::Filtered { .. } | StageOutcome::Discarded { .. } => Stage::Filter,
            StageOutcome::Detected { .. } => Stage::Detect,
            StageOutcome::Assembled { .. } => Stage::Assemble,
        }
    }

    pub fn target_state(&self) -> UnitState {
        match self {
            StageOutcome::Discarded { .. } => UnitState::Done,
            other => other.stage().success(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageOutcome::Captured { .. } => "captured",
            StageOutcome::Filtered { .. } => "filtered",
            StageOutcome::Discarded { .. } => "discarded",
            StageOutcome::Detected { .. } => "detected",
            StageOutcome::Assembled { .. } => "assembled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_states_are_skipped_when_disabled() {
        assert_eq!(Stage::Detect.predecessor(true), UnitState::Filtered);
        assert_eq!(Stage::Detect.predecessor(false), UnitState::Captured);
        assert!(UnitState::Captured.can_advance_to(UnitState::Detecting));
    }

    #[test]
    fn transitions_never_move_backwards() {
        assert!(!UnitState::Detected.can_advance_to(UnitState::Filtering));
        assert!(!UnitState::Done.can_advance_to(UnitState::Failed));
        assert!(UnitState::Detecting.can_advance_to(UnitState::Failed));
        assert!(!UnitState::Failed.can_advance_to(UnitState::Captured));
    }

    #[test]
    fn discarded_outcome_finishes_the_unit() {
        let outcome = StageOutcome::Discarded {
            qualifying_fraction: 0.0,
        };
        assert_eq!(outcome.stage(), Stage::Filter);
        assert_eq!(outcome.target_state(), UnitState::Done);
    }

    #[test]
    fn states_parse_case_insensitively() {
        assert_eq!("detecting".parse::<UnitState>().unwrap(), UnitState::Detecting);
        assert_eq!("ASSEMBLE".parse::<Stage>().unwrap(), Stage::Assemble);
        assert!("shipping".parse::<UnitState>().is_err());
    }

    #[test]
    fn outcome_json_is_tagged() {
        let json = serde_json::to_string(&StageOutcome::Detected { events: vec![] }).unwrap();
        assert_eq!(json, r#"{"kind":"detected","events":[]}"#);
    }
}
