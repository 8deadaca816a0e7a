//! Finish-line video pipeline
//!
//! This crate turns a continuous race-course video stream into time-accurate
//! line-crossing events and trimmed clips.
//!
//! # Architecture
//!
//! Work flows through independently running worker processes that share state
//! only through the work unit registry (SQLite) and an object store:
//!
//! 1. **Capture**: frames are buffered into fixed-duration segments and written
//!    to storage (`segment`).
//! 2. **Filter**: segments without qualifying motion are discarded, the rest are
//!    trimmed to the interesting window (`filter`).
//! 3. **Detect**: objects are tracked across frames and line crossings are
//!    emitted with sub-frame timestamps (`crossing`).
//! 4. **Assemble**: one clip is cut per crossing, borrowing frames from the
//!    adjacent segment when the clip straddles a boundary (`clip`).
//!
//! The registry (`registry`) is the only synchronization point. Every stage
//! claims a unit under a lease, and a late `complete` from a worker whose lease
//! expired is rejected.
//!
//! # Module Structure
//!
//! - `frame` / `ingest`: frame sources (synthetic `stub://` scenes, GStreamer streams)
//! - `segment`: segment container and the capture-side writer
//! - `storage`: object store contract and its local, in-memory and HTTP backends
//! - `detect`: detector backend contract and backends
//! - `worker`: per-mode run loops used by the `finishlined` daemon
//! - Core types: `WorkUnit`, `CrossingEvent`, `Clip`, `TimeWindow`

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub mod clip;
pub mod clock;
pub mod config;
pub mod crossing;
pub mod detect;
pub mod error;
pub mod filter;
pub mod frame;
pub mod ingest;
pub mod registry;
pub mod segment;
pub mod storage;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RegistryError, StageError};
pub use frame::{Frame, FrameSource};
pub use registry::{
    Adjacency, Claim, RegistryOptions, SqliteRegistry, Stage, StageOutcome, UnitRegistry,
    UnitState, UnitStatus,
};
pub use storage::{InMemoryObjectStore, LocalObjectStore, ObjectStore};

pub const MICROS_PER_SECOND: i64 = 1_000_000;

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:finishline_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection, rusqlite::Error> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        );
    }
    Connection::open(db_path)
}

/// Event identifiers name a race/event and become part of storage keys.
pub fn validate_event_id(event_id: &str) -> Result<()> {
    static EVENT_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = EVENT_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(event_id) {
        return Err(anyhow!("event_id must match ^[A-Za-z0-9_-]{{1,64}}$"));
    }
    Ok(())
}

/// Unit, crossing and clip identifiers share the event id alphabet but may be longer.
pub fn validate_unit_id(unit_id: &str) -> Result<()> {
    static UNIT_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = UNIT_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());
    if !re.is_match(unit_id) {
        return Err(anyhow!("unit id must match ^[A-Za-z0-9_-]{{1,128}}$"));
    }
    Ok(())
}

// -------------------- Time Windows --------------------

/// Closed wall-clock interval in microseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_us: i64,
    pub end_us: i64,
}

impl TimeWindow {
    pub fn new(start_us: i64, end_us: i64) -> Self {
        Self { start_us, end_us }
    }

    pub fn duration_us(&self) -> i64 {
        self.end_us - self.start_us
    }

    pub fn contains(&self, t_us: i64) -> bool {
        t_us >= self.start_us && t_us <= self.end_us
    }

    /// Overlap of two windows, `None` when they are disjoint.
    pub fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let start_us = self.start_us.max(other.start_us);
        let end_us = self.end_us.min(other.end_us);
        (start_us <= end_us).then_some(TimeWindow { start_us, end_us })
    }

    /// Clamp into `bounds`; a window entirely outside collapses onto the nearest edge.
    pub fn clamp_to(&self, bounds: &TimeWindow) -> TimeWindow {
        let start_us = self.start_us.clamp(bounds.start_us, bounds.end_us);
        let end_us = self.end_us.clamp(start_us, bounds.end_us);
        TimeWindow { start_us, end_us }
    }
}

// -------------------- Work Units --------------------

/// One captured time segment of video, as recorded by the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub event_id: String,
    pub start_us: i64,
    pub duration_us: i64,
    pub frame_rate: f64,
    /// Storage location of the segment, set once capture completed.
    pub location: Option<String>,
    pub state: UnitState,
    /// Worker currently holding the claim.
    pub owner: Option<String>,
    pub lease_expires_us: Option<i64>,
    pub retry_count: u32,
    pub failed_stage: Option<Stage>,
    pub failure_reason: Option<String>,
    /// Window proposed by the motion filter.
    pub trimmed_window: Option<TimeWindow>,
    pub created_us: i64,
    pub updated_us: i64,
}

impl WorkUnit {
    pub fn end_us(&self) -> i64 {
        self.start_us + self.duration_us
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_us, self.end_us())
    }

    /// Frames the crossing detector looks at: the trimmed window when the unit
    /// was filtered, the whole segment otherwise.
    pub fn analysis_window(&self) -> TimeWindow {
        self.trimmed_window.unwrap_or_else(|| self.window())
    }

    pub fn frame_interval_us(&self) -> i64 {
        frame_interval_us(self.frame_rate)
    }

    /// The segment bytes exist in storage.
    pub fn has_segment(&self) -> bool {
        self.location.is_some()
    }
}

pub fn frame_interval_us(frame_rate: f64) -> i64 {
    if frame_rate <= 0.0 {
        return 0;
    }
    (MICROS_PER_SECOND as f64 / frame_rate).round() as i64
}

/// Registration request for a unit that does not exist yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewWorkUnit {
    pub id: String,
    pub event_id: String,
    pub start_us: i64,
    pub duration_us: i64,
    pub frame_rate: f64,
}

impl NewWorkUnit {
    pub fn validate(&self) -> Result<()> {
        validate_unit_id(&self.id)?;
        validate_event_id(&self.event_id)?;
        if self.duration_us <= 0 {
            return Err(anyhow!("unit {} has non-positive duration", self.id));
        }
        if !(self.frame_rate > 0.0 && self.frame_rate.is_finite()) {
            return Err(anyhow!("unit {} has invalid frame rate", self.id));
        }
        Ok(())
    }
}

// -------------------- Crossing Events & Clips --------------------

/// Direction of a line crossing.
///
/// `Forward` moves from the negative to the positive side of the line as
/// defined by `crossing::LineSegment::side`. For a line drawn top to bottom in
/// image coordinates, forward is left to right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingDirection {
    Forward,
    Reverse,
}

/// Immutable record of a tracked object traversing the line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossingEvent {
    pub id: String,
    pub unit_id: String,
    /// Sub-frame interpolated wall-clock time.
    pub crossing_time_us: i64,
    pub track_id: u64,
    pub direction: CrossingDirection,
    pub confidence: f32,
    /// Frame on which the crossing was observed (the first frame past the line).
    pub frame_index: u64,
}

/// Final clip artifact metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub crossing_id: String,
    pub unit_id: String,
    pub start_us: i64,
    pub end_us: i64,
    pub location: String,
    pub frame_count: u32,
    /// The requested window could not be fully covered.
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_follow_allowlist() {
        assert!(validate_event_id("oslo-marathon_2026").is_ok());
        assert!(validate_event_id("").is_err());
        assert!(validate_event_id("../etc").is_err());
        assert!(validate_event_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn clamp_keeps_window_inside_bounds() {
        let bounds = TimeWindow::new(0, 30_000_000);
        let w = TimeWindow::new(-2_000_000, 12_000_000).clamp_to(&bounds);
        assert_eq!(w, TimeWindow::new(0, 12_000_000));

        let outside = TimeWindow::new(40_000_000, 50_000_000).clamp_to(&bounds);
        assert_eq!(outside.duration_us(), 0);
    }

    #[test]
    fn intersect_returns_none_for_disjoint_windows() {
        let a = TimeWindow::new(0, 10);
        assert_eq!(a.intersect(&TimeWindow::new(11, 20)), None);
        assert_eq!(a.intersect(&TimeWindow::new(5, 20)), Some(TimeWindow::new(5, 10)));
    }

    #[test]
    fn frame_interval_rounds_to_microseconds() {
        assert_eq!(frame_interval_us(10.0), 100_000);
        assert_eq!(frame_interval_us(30.0), 33_333);
        assert_eq!(frame_interval_us(0.0), 0);
    }
}
