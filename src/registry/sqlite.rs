use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::state::ParseStateError;
use super::{
    Adjacency, Claim, EventRecord, RegistryOptions, Stage, StageOutcome, StateTransition,
    UnitRegistry, UnitState,
};
use crate::clock::{Clock, SystemClock};
use crate::error::RegistryError;
use crate::{open_db_connection, Clip, CrossingEvent, NewWorkUnit, TimeWindow, WorkUnit};

const UNIT_COLUMNS: &str = "id, event_id, start_us, duration_us, frame_rate, location, state, \
     owner, lease_expires_us, retry_count, failed_stage, failure_reason, trimmed_start_us, \
     trimmed_end_us, created_us, updated_us";

/// Registry backed by a single SQLite database shared by every worker process.
///
/// Each mutating operation runs in an `IMMEDIATE` transaction, so the
/// read-check-write sequence inside it is serialized against other processes
/// by SQLite's write lock.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    options: RegistryOptions,
    clock: Arc<dyn Clock>,
}

impl SqliteRegistry {
    pub fn open(db_path: &str, options: RegistryOptions) -> Result<Self, RegistryError> {
        Self::open_with_clock(db_path, options, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        db_path: &str,
        options: RegistryOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RegistryError> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let registry = Self {
            conn: Mutex::new(conn),
            options,
            clock,
        };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn ensure_schema(&self) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS work_units (
              id TEXT PRIMARY KEY,
              event_id TEXT NOT NULL,
              start_us INTEGER NOT NULL,
              duration_us INTEGER NOT NULL,
              frame_rate REAL NOT NULL,
              location TEXT,
              state TEXT NOT NULL,
              owner TEXT,
              claim_token TEXT,
              lease_expires_us INTEGER,
              retry_count INTEGER NOT NULL DEFAULT 0,
              failed_stage TEXT,
              failure_reason TEXT,
              trimmed_start_us INTEGER,
              trimmed_end_us INTEGER,
              created_us INTEGER NOT NULL,
              updated_us INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_units_state ON work_units(state, start_us);
            CREATE INDEX IF NOT EXISTS idx_units_event ON work_units(event_id, start_us);

            CREATE TABLE IF NOT EXISTS stage_outcomes (
              unit_id TEXT NOT NULL,
              stage TEXT NOT NULL,
              claim_token TEXT NOT NULL,
              outcome_json TEXT NOT NULL,
              recorded_us INTEGER NOT NULL,
              PRIMARY KEY (unit_id, stage)
            );

            CREATE TABLE IF NOT EXISTS crossing_events (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              unit_id TEXT NOT NULL,
              crossing_time_us INTEGER NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_unit ON crossing_events(unit_id, crossing_time_us);

            CREATE TABLE IF NOT EXISTS clips (
              id TEXT PRIMARY KEY,
              unit_id TEXT NOT NULL,
              crossing_id TEXT NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clips_unit ON clips(unit_id);

            CREATE TABLE IF NOT EXISTS state_transitions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              unit_id TEXT NOT NULL,
              from_state TEXT,
              to_state TEXT NOT NULL,
              stage TEXT,
              worker_id TEXT,
              at_us INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_unit ON state_transitions(unit_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    fn insert_unit(
        &self,
        unit: &NewWorkUnit,
        state: UnitState,
        location: Option<&str>,
    ) -> Result<WorkUnit, RegistryError> {
        unit.validate()
            .map_err(|e| RegistryError::InvalidUnit(e.to_string()))?;
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM work_units WHERE id = ?1",
                params![unit.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(RegistryError::DuplicateUnit(unit.id.clone()));
        }
        tx.execute(
            r#"
            INSERT INTO work_units(id, event_id, start_us, duration_us, frame_rate, location,
                                   state, retry_count, created_us, updated_us)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            "#,
            params![
                unit.id,
                unit.event_id,
                unit.start_us,
                unit.duration_us,
                unit.frame_rate,
                location,
                state.as_str(),
                now
            ],
        )?;
        record_transition(&tx, &unit.id, None, state, None, None, now)?;
        let created = load_unit(&tx, &unit.id)?;
        tx.commit()?;
        Ok(created)
    }
}

impl UnitRegistry for SqliteRegistry {
    fn options(&self) -> RegistryOptions {
        self.options
    }

    fn create_pending(&self, unit: &NewWorkUnit) -> Result<WorkUnit, RegistryError> {
        self.insert_unit(unit, UnitState::Pending, None)
    }

    fn register_captured(
        &self,
        unit: &NewWorkUnit,
        location: &str,
    ) -> Result<WorkUnit, RegistryError> {
        let created = self.insert_unit(unit, UnitState::Captured, Some(location))?;
        log::info!(
            "registry: registered captured segment {} at {}",
            created.id,
            location
        );
        Ok(created)
    }

    fn claim(
        &self,
        unit_id: &str,
        stage: Stage,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Claim, RegistryError> {
        self.ensure_stage_enabled(stage)?;
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claim = claim_in_tx(&tx, unit_id, stage, worker_id, lease, now, self.options)?;
        tx.commit()?;
        Ok(claim)
    }

    fn claim_next(
        &self,
        stage: Stage,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Claim>, RegistryError> {
        self.ensure_stage_enabled(stage)?;
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<String> = tx
            .query_row(
                r#"
                SELECT id FROM work_units
                WHERE (state = ?1 AND owner IS NULL)
                   OR (state = ?2 AND lease_expires_us <= ?3)
                ORDER BY start_us, id
                LIMIT 1
                "#,
                params![
                    stage.predecessor(self.options.filter_enabled).as_str(),
                    stage.in_progress().as_str(),
                    now
                ],
                |row| row.get(0),
            )
            .optional()?;
        let Some(unit_id) = candidate else {
            return Ok(None);
        };
        let claim = claim_in_tx(&tx, &unit_id, stage, worker_id, lease, now, self.options)?;
        tx.commit()?;
        Ok(Some(claim))
    }

    fn renew(&self, claim: &mut Claim, lease: Duration) -> Result<(), RegistryError> {
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = load_hold(&tx, &claim.unit_id)?;
        if !held.is_live(claim, now) {
            return Err(stale(claim));
        }
        let expires = now + lease_us(lease);
        tx.execute(
            "UPDATE work_units SET lease_expires_us = ?1, updated_us = ?2 WHERE id = ?3",
            params![expires, now, claim.unit_id],
        )?;
        tx.commit()?;
        claim.lease_expires_us = expires;
        log::debug!(
            "registry: renewed {} for {} until {}",
            claim.unit_id,
            claim.worker_id,
            expires
        );
        Ok(())
    }

    fn complete(&self, claim: &Claim, outcome: &StageOutcome) -> Result<WorkUnit, RegistryError> {
        if outcome.stage() != claim.stage {
            return Err(RegistryError::MismatchedOutcome {
                stage: claim.stage,
                outcome: outcome.kind(),
            });
        }
        let outcome_json = serde_json::to_string(outcome)?;
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recorded: Option<(String, String)> = tx
            .query_row(
                "SELECT claim_token, outcome_json FROM stage_outcomes WHERE unit_id = ?1 AND stage = ?2",
                params![claim.unit_id, claim.stage.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((token, previous_json)) = recorded {
            if token != claim.token {
                return Err(stale(claim));
            }
            if previous_json != outcome_json {
                return Err(RegistryError::ConflictingOutcome {
                    unit_id: claim.unit_id.clone(),
                    stage: claim.stage,
                });
            }
            log::debug!(
                "registry: repeated {} completion of {} ignored",
                claim.stage,
                claim.unit_id
            );
            return load_unit(&tx, &claim.unit_id);
        }

        let held = load_hold(&tx, &claim.unit_id)?;
        if held.token.as_deref() != Some(claim.token.as_str()) {
            return Err(stale(claim));
        }
        if held.state != claim.stage.in_progress() {
            return Err(RegistryError::InvalidState {
                unit_id: claim.unit_id.clone(),
                stage: claim.stage,
                expected: claim.stage.in_progress(),
                actual: held.state,
            });
        }
        if !held.is_live(claim, now) {
            return Err(stale(claim));
        }

        let target = outcome.target_state();
        let (location, duration_us, trimmed) = match outcome {
            StageOutcome::Captured {
                location,
                duration_us,
                ..
            } => (Some(location.as_str()), Some(*duration_us), None),
            StageOutcome::Filtered { window, .. } => (None, None, Some(*window)),
            _ => (None, None, None),
        };
        tx.execute(
            r#"
            UPDATE work_units
            SET state = ?1, owner = NULL, claim_token = NULL, lease_expires_us = NULL,
                updated_us = ?2,
                location = COALESCE(?3, location),
                duration_us = COALESCE(?4, duration_us),
                trimmed_start_us = COALESCE(?5, trimmed_start_us),
                trimmed_end_us = COALESCE(?6, trimmed_end_us)
            WHERE id = ?7
            "#,
            params![
                target.as_str(),
                now,
                location,
                duration_us,
                trimmed.map(|w| w.start_us),
                trimmed.map(|w| w.end_us),
                claim.unit_id
            ],
        )?;

        match outcome {
            StageOutcome::Detected { events } => {
                for event in events {
                    tx.execute(
                        r#"
                        INSERT INTO crossing_events(id, unit_id, crossing_time_us, payload_json)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                        params![
                            event.id,
                            claim.unit_id,
                            event.crossing_time_us,
                            serde_json::to_string(event)?
                        ],
                    )?;
                }
            }
            StageOutcome::Assembled { clips } => {
                for clip in clips {
                    tx.execute(
                        r#"
                        INSERT INTO clips(id, unit_id, crossing_id, payload_json)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                        params![
                            clip.id,
                            claim.unit_id,
                            clip.crossing_id,
                            serde_json::to_string(clip)?
                        ],
                    )?;
                }
            }
            _ => {}
        }

        tx.execute(
            r#"
            INSERT INTO stage_outcomes(unit_id, stage, claim_token, outcome_json, recorded_us)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                claim.unit_id,
                claim.stage.as_str(),
                claim.token,
                outcome_json,
                now
            ],
        )?;
        record_transition(
            &tx,
            &claim.unit_id,
            Some(held.state),
            target,
            Some(claim.stage),
            Some(&claim.worker_id),
            now,
        )?;
        let unit = load_unit(&tx, &claim.unit_id)?;
        tx.commit()?;
        log::info!(
            "registry: {} completed {} ({}) -> {}",
            claim.worker_id,
            claim.unit_id,
            outcome.kind(),
            target
        );
        Ok(unit)
    }

    fn fail(&self, claim: &Claim, reason: &str) -> Result<WorkUnit, RegistryError> {
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held = load_hold(&tx, &claim.unit_id)?;
        if held.token.as_deref() != Some(claim.token.as_str()) {
            return Err(stale(claim));
        }
        if held.state != claim.stage.in_progress() {
            return Err(RegistryError::InvalidState {
                unit_id: claim.unit_id.clone(),
                stage: claim.stage,
                expected: claim.stage.in_progress(),
                actual: held.state,
            });
        }
        if !held.is_live(claim, now) {
            return Err(stale(claim));
        }
        let retries = held.retry_count + 1;
        tx.execute(
            r#"
            UPDATE work_units
            SET state = ?1, owner = NULL, claim_token = NULL, lease_expires_us = NULL,
                retry_count = ?2, failed_stage = ?3, failure_reason = ?4, updated_us = ?5
            WHERE id = ?6
            "#,
            params![
                UnitState::Failed.as_str(),
                retries,
                claim.stage.as_str(),
                reason,
                now,
                claim.unit_id
            ],
        )?;
        record_transition(
            &tx,
            &claim.unit_id,
            Some(held.state),
            UnitState::Failed,
            Some(claim.stage),
            Some(&claim.worker_id),
            now,
        )?;
        let unit = load_unit(&tx, &claim.unit_id)?;
        tx.commit()?;
        if retries >= self.options.max_retries || claim.stage == Stage::Capture {
            log::error!(
                "registry: {} permanently FAILED at {} after {} attempt(s): {}",
                claim.unit_id,
                claim.stage,
                retries,
                reason
            );
        } else {
            log::warn!(
                "registry: {} FAILED at {} (attempt {} of {}): {}",
                claim.unit_id,
                claim.stage,
                retries,
                self.options.max_retries,
                reason
            );
        }
        Ok(unit)
    }

    fn requeue_failed(&self, unit_id: &str) -> Result<WorkUnit, RegistryError> {
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let unit = load_unit(&tx, unit_id)?;
        if unit.state != UnitState::Failed {
            return Err(RegistryError::NotFailed {
                unit_id: unit_id.to_string(),
                actual: unit.state,
            });
        }
        let stage = unit
            .failed_stage
            .ok_or_else(|| RegistryError::Corrupt(format!("{unit_id} is FAILED without a stage")))?;
        if stage == Stage::Capture {
            return Err(RegistryError::NotRetryable {
                unit_id: unit_id.to_string(),
                stage,
            });
        }
        if unit.retry_count >= self.options.max_retries {
            return Err(RegistryError::RetryCeilingExceeded {
                unit_id: unit_id.to_string(),
                retries: unit.retry_count,
            });
        }
        let target = stage.predecessor(self.options.filter_enabled);
        tx.execute(
            r#"
            UPDATE work_units
            SET state = ?1, failed_stage = NULL, failure_reason = NULL, updated_us = ?2
            WHERE id = ?3
            "#,
            params![target.as_str(), now, unit_id],
        )?;
        record_retry_reset(&tx, unit_id, target, stage, now)?;
        let requeued = load_unit(&tx, unit_id)?;
        tx.commit()?;
        log::info!(
            "registry: requeued {} for {} (retry {})",
            unit_id,
            stage,
            requeued.retry_count
        );
        Ok(requeued)
    }

    fn fail_expired_captures(&self) -> Result<Vec<WorkUnit>, RegistryError> {
        let now = self.clock.now_us();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let expired: Vec<(String, Option<String>)> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id, owner FROM work_units
                WHERE state = ?1 AND lease_expires_us <= ?2
                ORDER BY start_us, id
                "#,
            )?;
            let rows = stmt.query_map(params![UnitState::Capturing.as_str(), now], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut failed = Vec::with_capacity(expired.len());
        for (unit_id, owner) in expired {
            let reason = format!(
                "capture lease of {} expired before the segment was stored",
                owner.as_deref().unwrap_or("an unknown worker")
            );
            tx.execute(
                r#"
                UPDATE work_units
                SET state = ?1, owner = NULL, claim_token = NULL, lease_expires_us = NULL,
                    retry_count = retry_count + 1, failed_stage = ?2, failure_reason = ?3,
                    updated_us = ?4
                WHERE id = ?5
                "#,
                params![
                    UnitState::Failed.as_str(),
                    Stage::Capture.as_str(),
                    reason,
                    now,
                    unit_id
                ],
            )?;
            record_transition(
                &tx,
                &unit_id,
                Some(UnitState::Capturing),
                UnitState::Failed,
                Some(Stage::Capture),
                None,
                now,
            )?;
            failed.push(load_unit(&tx, &unit_id)?);
        }
        tx.commit()?;
        for unit in &failed {
            log::error!(
                "registry: {} permanently FAILED at capture: {}",
                unit.id,
                unit.failure_reason.as_deref().unwrap_or_default()
            );
        }
        Ok(failed)
    }

    fn get(&self, unit_id: &str) -> Result<WorkUnit, RegistryError> {
        let conn = self.lock()?;
        load_unit(&conn, unit_id)
    }

    fn list(&self, state: Option<UnitState>, limit: usize) -> Result<Vec<WorkUnit>, RegistryError> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let units = match state {
            Some(state) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {UNIT_COLUMNS} FROM work_units WHERE state = ?1 ORDER BY start_us, id LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![state.as_str(), limit], unit_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {UNIT_COLUMNS} FROM work_units ORDER BY start_us, id LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], unit_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(units)
    }

    fn adjacent(
        &self,
        unit: &WorkUnit,
        side: Adjacency,
    ) -> Result<Option<WorkUnit>, RegistryError> {
        let conn = self.lock()?;
        let sql = match side {
            Adjacency::Before => format!(
                "SELECT {UNIT_COLUMNS} FROM work_units \
                 WHERE event_id = ?1 AND id != ?2 AND start_us < ?3 \
                 ORDER BY start_us DESC LIMIT 1"
            ),
            Adjacency::After => format!(
                "SELECT {UNIT_COLUMNS} FROM work_units \
                 WHERE event_id = ?1 AND id != ?2 AND start_us > ?3 \
                 ORDER BY start_us ASC LIMIT 1"
            ),
        };
        let neighbour = conn
            .query_row(
                &sql,
                params![unit.event_id, unit.id, unit.start_us],
                unit_from_row,
            )
            .optional()?;
        let tolerance = 2 * unit.frame_interval_us();
        Ok(neighbour.filter(|other| {
            let gap = match side {
                Adjacency::Before => unit.start_us - other.end_us(),
                Adjacency::After => other.start_us - unit.end_us(),
            };
            gap.abs() <= tolerance
        }))
    }

    fn events_for_unit(&self, unit_id: &str) -> Result<Vec<CrossingEvent>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT payload_json FROM crossing_events WHERE unit_id = ?1 ORDER BY crossing_time_us, id",
        )?;
        let rows = stmt.query_map(params![unit_id], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for payload in rows {
            events.push(serde_json::from_str(&payload?)?);
        }
        Ok(events)
    }

    fn clips_for_unit(&self, unit_id: &str) -> Result<Vec<Clip>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT payload_json FROM clips WHERE unit_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![unit_id], |row| row.get::<_, String>(0))?;
        let mut clips = Vec::new();
        for payload in rows {
            clips.push(serde_json::from_str(&payload?)?);
        }
        Ok(clips)
    }

    fn event(&self, event_id: &str) -> Result<Option<CrossingEvent>, RegistryError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM crossing_events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    fn events_since(&self, cursor: i64, limit: usize) -> Result<Vec<EventRecord>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, payload_json FROM crossing_events WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (seq, payload) = row?;
            records.push(EventRecord {
                seq,
                event: serde_json::from_str(&payload)?,
            });
        }
        Ok(records)
    }

    fn history(&self, unit_id: &str) -> Result<Vec<StateTransition>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT unit_id, from_state, to_state, stage, worker_id, at_us
            FROM state_transitions WHERE unit_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![unit_id], |row| {
            let from: Option<String> = row.get(1)?;
            let to: String = row.get(2)?;
            let stage: Option<String> = row.get(3)?;
            Ok(StateTransition {
                unit_id: row.get(0)?,
                from: from.map(|s| parse_column(1, &s)).transpose()?,
                to: parse_column(2, &to)?,
                stage: stage.map(|s| parse_column(3, &s)).transpose()?,
                worker_id: row.get(4)?,
                at_us: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn counts(&self) -> Result<Vec<(UnitState, u64)>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM work_units GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((parse_column::<UnitState>(0, &state)?, count as u64))
        })?;
        let mut counts = rows.collect::<Result<Vec<_>, _>>()?;
        counts.sort_by_key(|(state, _)| *state as u8);
        Ok(counts)
    }
}

impl SqliteRegistry {
    fn ensure_stage_enabled(&self, stage: Stage) -> Result<(), RegistryError> {
        if stage == Stage::Filter && !self.options.filter_enabled {
            return Err(RegistryError::StageDisabled(stage));
        }
        Ok(())
    }
}

/// Claim-relevant columns of one unit.
struct Hold {
    state: UnitState,
    owner: Option<String>,
    token: Option<String>,
    lease_expires_us: Option<i64>,
    retry_count: u32,
}

impl Hold {
    fn is_live(&self, claim: &Claim, now_us: i64) -> bool {
        self.token.as_deref() == Some(claim.token.as_str())
            && self.state == claim.stage.in_progress()
            && self.lease_expires_us.is_some_and(|expires| expires > now_us)
    }
}

fn load_hold(conn: &Connection, unit_id: &str) -> Result<Hold, RegistryError> {
    let row: Option<(String, Option<String>, Option<String>, Option<i64>, u32)> = conn
        .query_row(
            "SELECT state, owner, claim_token, lease_expires_us, retry_count FROM work_units WHERE id = ?1",
            params![unit_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;
    let (state, owner, token, lease_expires_us, retry_count) =
        row.ok_or_else(|| RegistryError::NotFound(unit_id.to_string()))?;
    Ok(Hold {
        state: state
            .parse()
            .map_err(|e: ParseStateError| RegistryError::Corrupt(e.to_string()))?,
        owner,
        token,
        lease_expires_us,
        retry_count,
    })
}

fn claim_in_tx(
    conn: &Connection,
    unit_id: &str,
    stage: Stage,
    worker_id: &str,
    lease: Duration,
    now_us: i64,
    options: RegistryOptions,
) -> Result<Claim, RegistryError> {
    let held = load_hold(conn, unit_id)?;
    let predecessor = stage.predecessor(options.filter_enabled);
    let in_progress = stage.in_progress();

    let reclaimed_from = if held.state == predecessor && held.owner.is_none() {
        None
    } else if held.state == in_progress {
        match held.lease_expires_us {
            Some(expires) if expires <= now_us => held.owner.clone(),
            _ => {
                return Err(RegistryError::AlreadyClaimed {
                    unit_id: unit_id.to_string(),
                    owner: held.owner.unwrap_or_default(),
                })
            }
        }
    } else {
        return Err(RegistryError::InvalidState {
            unit_id: unit_id.to_string(),
            stage,
            expected: predecessor,
            actual: held.state,
        });
    };

    let token = new_claim_token();
    let expires = now_us + lease_us(lease);
    tx_update_claim(conn, unit_id, held.state, in_progress, worker_id, &token, expires, now_us)?;

    match reclaimed_from {
        Some(previous) => log::warn!(
            "registry: {} reclaimed {} at {} after lease of {} expired",
            worker_id,
            unit_id,
            stage,
            previous
        ),
        None => {
            record_transition(
                conn,
                unit_id,
                Some(held.state),
                in_progress,
                Some(stage),
                Some(worker_id),
                now_us,
            )?;
            log::info!("registry: {} claimed {} for {}", worker_id, unit_id, stage);
        }
    }

    Ok(Claim {
        unit_id: unit_id.to_string(),
        stage,
        worker_id: worker_id.to_string(),
        token,
        lease_expires_us: expires,
    })
}

#[allow(clippy::too_many_arguments)]
fn tx_update_claim(
    conn: &Connection,
    unit_id: &str,
    from: UnitState,
    to: UnitState,
    worker_id: &str,
    token: &str,
    expires_us: i64,
    now_us: i64,
) -> Result<(), RegistryError> {
    let changed = conn.execute(
        r#"
        UPDATE work_units
        SET state = ?1, owner = ?2, claim_token = ?3, lease_expires_us = ?4, updated_us = ?5
        WHERE id = ?6 AND state = ?7
        "#,
        params![to.as_str(), worker_id, token, expires_us, now_us, unit_id, from.as_str()],
    )?;
    if changed != 1 {
        return Err(RegistryError::Corrupt(format!(
            "claim update on {unit_id} touched {changed} rows"
        )));
    }
    Ok(())
}

/// Append one forward transition to the audit trail.
///
/// `from == None` is unit creation, which may only land in `PENDING` or
/// `CAPTURED`. Everything else must move forward in pipeline order or into
/// `FAILED` from an in-progress state.
fn record_transition(
    conn: &Connection,
    unit_id: &str,
    from: Option<UnitState>,
    to: UnitState,
    stage: Option<Stage>,
    worker_id: Option<&str>,
    at_us: i64,
) -> Result<(), RegistryError> {
    let allowed = match from {
        None => matches!(to, UnitState::Pending | UnitState::Captured),
        Some(from) => from.can_advance_to(to),
    };
    if !allowed {
        return Err(illegal_transition(unit_id, from, to));
    }
    insert_transition(conn, unit_id, from, to, stage, worker_id, at_us)
}

/// The one move out of `FAILED`: back to the resting state before `stage`.
fn record_retry_reset(
    conn: &Connection,
    unit_id: &str,
    to: UnitState,
    stage: Stage,
    at_us: i64,
) -> Result<(), RegistryError> {
    if to.is_terminal() || to.is_in_progress() {
        return Err(illegal_transition(unit_id, Some(UnitState::Failed), to));
    }
    insert_transition(
        conn,
        unit_id,
        Some(UnitState::Failed),
        to,
        Some(stage),
        None,
        at_us,
    )
}

fn illegal_transition(unit_id: &str, from: Option<UnitState>, to: UnitState) -> RegistryError {
    RegistryError::IllegalTransition {
        unit_id: unit_id.to_string(),
        from: from.map_or("nothing", |s| s.as_str()),
        to,
    }
}

fn insert_transition(
    conn: &Connection,
    unit_id: &str,
    from: Option<UnitState>,
    to: UnitState,
    stage: Option<Stage>,
    worker_id: Option<&str>,
    at_us: i64,
) -> Result<(), RegistryError> {
    conn.execute(
        r#"
        INSERT INTO state_transitions(unit_id, from_state, to_state, stage, worker_id, at_us)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            unit_id,
            from.map(|s| s.as_str()),
            to.as_str(),
            stage.map(|s| s.as_str()),
            worker_id,
            at_us
        ],
    )?;
    Ok(())
}

fn load_unit(conn: &Connection, unit_id: &str) -> Result<WorkUnit, RegistryError> {
    conn.query_row(
        &format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = ?1"),
        params![unit_id],
        unit_from_row,
    )
    .optional()?
    .ok_or_else(|| RegistryError::NotFound(unit_id.to_string()))
}

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<WorkUnit> {
    let state: String = row.get(6)?;
    let failed_stage: Option<String> = row.get(10)?;
    let trimmed_start: Option<i64> = row.get(12)?;
    let trimmed_end: Option<i64> = row.get(13)?;
    Ok(WorkUnit {
        id: row.get(0)?,
        event_id: row.get(1)?,
        start_us: row.get(2)?,
        duration_us: row.get(3)?,
        frame_rate: row.get(4)?,
        location: row.get(5)?,
        state: parse_column(6, &state)?,
        owner: row.get(7)?,
        lease_expires_us: row.get(8)?,
        retry_count: row.get(9)?,
        failed_stage: failed_stage.map(|s| parse_column(10, &s)).transpose()?,
        failure_reason: row.get(11)?,
        trimmed_window: match (trimmed_start, trimmed_end) {
            (Some(start_us), Some(end_us)) => Some(TimeWindow { start_us, end_us }),
            _ => None,
        },
        created_us: row.get(14)?,
        updated_us: row.get(15)?,
    })
}

fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseStateError>,
{
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn stale(claim: &Claim) -> RegistryError {
    RegistryError::StaleClaim {
        unit_id: claim.unit_id.clone(),
        stage: claim.stage,
    }
}

fn lease_us(lease: Duration) -> i64 {
    i64::try_from(lease.as_micros()).unwrap_or(i64::MAX / 2)
}

fn new_claim_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::CrossingDirection;

    const LEASE: Duration = Duration::from_secs(300);

    fn registry(options: RegistryOptions) -> (SqliteRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000));
        let registry =
            SqliteRegistry::open_with_clock(&crate::shared_memory_uri(), options, clock.clone())
                .expect("open registry");
        (registry, clock)
    }

    fn new_unit(id: &str, start_us: i64) -> NewWorkUnit {
        NewWorkUnit {
            id: id.to_string(),
            event_id: "race".to_string(),
            start_us,
            duration_us: 15_000_000,
            frame_rate: 10.0,
        }
    }

    fn captured(registry: &SqliteRegistry, id: &str, start_us: i64) -> WorkUnit {
        registry
            .register_captured(&new_unit(id, start_us), &format!("events/race/captured/{id}"))
            .expect("register")
    }

    #[test]
    fn duplicate_units_are_rejected() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let err = registry
            .create_pending(&new_unit("u1", 0))
            .expect_err("duplicate");
        assert!(matches!(err, RegistryError::DuplicateUnit(_)));
    }

    #[test]
    fn invalid_units_are_rejected() {
        let (registry, _) = registry(RegistryOptions::default());
        let mut unit = new_unit("u1", 0);
        unit.event_id = "no spaces".into();
        assert!(matches!(
            registry.create_pending(&unit),
            Err(RegistryError::InvalidUnit(_))
        ));
    }

    #[test]
    fn claim_rejects_out_of_order_stage() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let err = registry
            .claim("u1", Stage::Detect, "w1", LEASE)
            .expect_err("detect before filter");
        match err {
            RegistryError::InvalidState {
                expected, actual, ..
            } => {
                assert_eq!(expected, UnitState::Filtered);
                assert_eq!(actual, UnitState::Captured);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn second_claim_is_already_claimed() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        registry.claim("u1", Stage::Filter, "w1", LEASE).unwrap();
        let err = registry
            .claim("u1", Stage::Filter, "w2", LEASE)
            .expect_err("contended");
        assert!(matches!(err, RegistryError::AlreadyClaimed { ref owner, .. } if owner == "w1"));
    }

    #[test]
    fn filter_claims_are_refused_when_filtering_is_disabled() {
        let (registry, _) = registry(RegistryOptions {
            filter_enabled: false,
            max_retries: 3,
        });
        captured(&registry, "u1", 0);
        assert!(matches!(
            registry.claim("u1", Stage::Filter, "w1", LEASE),
            Err(RegistryError::StageDisabled(Stage::Filter))
        ));
        let claim = registry.claim("u1", Stage::Detect, "w1", LEASE).unwrap();
        assert_eq!(claim.stage, Stage::Detect);
    }

    #[test]
    fn claim_next_takes_oldest_claimable_unit() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "late", 30_000_000);
        captured(&registry, "early", 15_000_000);
        let claim = registry
            .claim_next(Stage::Filter, "w1", LEASE)
            .unwrap()
            .expect("claimable");
        assert_eq!(claim.unit_id, "early");
        let next = registry
            .claim_next(Stage::Filter, "w1", LEASE)
            .unwrap()
            .expect("claimable");
        assert_eq!(next.unit_id, "late");
        assert!(registry
            .claim_next(Stage::Filter, "w1", LEASE)
            .unwrap()
            .is_none());
    }

    #[test]
    fn expired_lease_is_reclaimable_and_late_complete_is_stale() {
        let (registry, clock) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let first = registry.claim("u1", Stage::Filter, "w1", LEASE).unwrap();
        clock.advance_secs(301);

        let second = registry
            .claim_next(Stage::Filter, "w2", LEASE)
            .unwrap()
            .expect("expired lease is claimable");
        assert_eq!(second.unit_id, "u1");
        assert_ne!(second.token, first.token);

        let outcome = StageOutcome::Discarded {
            qualifying_fraction: 0.0,
        };
        let err = registry.complete(&first, &outcome).expect_err("late");
        assert!(matches!(err, RegistryError::StaleClaim { .. }));
        registry.complete(&second, &outcome).unwrap();
        let err = registry.complete(&first, &outcome).expect_err("still late");
        assert!(matches!(err, RegistryError::StaleClaim { .. }));
    }

    #[test]
    fn renew_extends_live_lease_only() {
        let (registry, clock) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let mut claim = registry.claim("u1", Stage::Filter, "w1", LEASE).unwrap();
        clock.advance_secs(200);
        registry.renew(&mut claim, LEASE).unwrap();
        clock.advance_secs(200);
        assert!(registry.claim("u1", Stage::Filter, "w2", LEASE).is_err());
        clock.advance_secs(101);
        assert!(matches!(
            registry.renew(&mut claim, LEASE),
            Err(RegistryError::StaleClaim { .. })
        ));
    }

    #[test]
    fn complete_rejects_outcome_of_another_stage() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let claim = registry.claim("u1", Stage::Filter, "w1", LEASE).unwrap();
        let err = registry
            .complete(&claim, &StageOutcome::Detected { events: vec![] })
            .expect_err("wrong stage");
        assert!(matches!(err, RegistryError::MismatchedOutcome { .. }));
    }

    #[test]
    fn detected_events_are_persisted_and_polled() {
        let (registry, _) = registry(RegistryOptions {
            filter_enabled: false,
            max_retries: 3,
        });
        captured(&registry, "u1", 0);
        let claim = registry.claim("u1", Stage::Detect, "w1", LEASE).unwrap();
        let event = CrossingEvent {
            id: "u1-x000".into(),
            unit_id: "u1".into(),
            crossing_time_us: 7_500_000,
            track_id: 1,
            direction: CrossingDirection::Forward,
            confidence: 0.9,
            frame_index: 75,
        };
        registry
            .complete(
                &claim,
                &StageOutcome::Detected {
                    events: vec![event.clone()],
                },
            )
            .unwrap();

        assert_eq!(registry.events_for_unit("u1").unwrap(), vec![event.clone()]);
        assert_eq!(registry.event("u1-x000").unwrap(), Some(event.clone()));
        let feed = registry.events_since(0, 10).unwrap();
        assert_eq!(feed.len(), 1);
        assert!(registry.events_since(feed[0].seq, 10).unwrap().is_empty());
    }

    #[test]
    fn failed_capture_is_not_requeued() {
        let (registry, _) = registry(RegistryOptions::default());
        registry.create_pending(&new_unit("u1", 0)).unwrap();
        let claim = registry.claim("u1", Stage::Capture, "cap", LEASE).unwrap();
        registry.fail(&claim, "disk full").unwrap();
        assert!(matches!(
            registry.requeue_failed("u1"),
            Err(RegistryError::NotRetryable { .. })
        ));
    }

    #[test]
    fn expired_capture_leases_end_failed_with_a_reason() {
        let (registry, clock) = registry(RegistryOptions::default());
        registry.create_pending(&new_unit("u1", 0)).unwrap();
        registry.create_pending(&new_unit("u2", 15_000_000)).unwrap();
        registry.claim("u1", Stage::Capture, "cap-dead", LEASE).unwrap();
        clock.advance_secs(301);
        registry.claim("u2", Stage::Capture, "cap-live", LEASE).unwrap();

        let failed = registry.fail_expired_captures().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "u1");
        assert_eq!(failed[0].state, UnitState::Failed);
        assert_eq!(failed[0].failed_stage, Some(Stage::Capture));
        assert!(failed[0].failure_reason.as_deref().unwrap().contains("cap-dead"));
        assert_eq!(registry.get("u2").unwrap().state, UnitState::Capturing);
        assert!(registry.fail_expired_captures().unwrap().is_empty());

        let last = registry.history("u1").unwrap().pop().unwrap();
        assert_eq!(last.from, Some(UnitState::Capturing));
        assert_eq!(last.to, UnitState::Failed);
    }

    #[test]
    fn backwards_transitions_are_refused() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "u1", 0);
        let conn = registry.lock().unwrap();

        let err = record_transition(
            &conn,
            "u1",
            Some(UnitState::Detected),
            UnitState::Captured,
            Some(Stage::Detect),
            None,
            0,
        )
        .expect_err("backwards");
        assert!(matches!(
            err,
            RegistryError::IllegalTransition {
                to: UnitState::Captured,
                ..
            }
        ));
        assert!(record_transition(&conn, "u1", Some(UnitState::Done), UnitState::Failed, None, None, 0).is_err());
        assert!(record_transition(&conn, "u1", None, UnitState::Detected, None, None, 0).is_err());
        assert!(record_retry_reset(&conn, "u1", UnitState::Detecting, Stage::Detect, 0).is_err());
        assert!(record_retry_reset(&conn, "u1", UnitState::Filtered, Stage::Detect, 0).is_ok());
        drop(conn);

        let history = registry.history("u1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from, Some(UnitState::Failed));
    }

    #[test]
    fn adjacency_requires_contiguous_units_of_same_event() {
        let (registry, _) = registry(RegistryOptions::default());
        let first = captured(&registry, "a", 0);
        let second = captured(&registry, "b", 15_000_000);
        captured(&registry, "c", 60_000_000);

        let after = registry.adjacent(&first, Adjacency::After).unwrap();
        assert_eq!(after.map(|u| u.id), Some("b".to_string()));
        let before = registry.adjacent(&second, Adjacency::Before).unwrap();
        assert_eq!(before.map(|u| u.id), Some("a".to_string()));
        assert!(registry.adjacent(&second, Adjacency::After).unwrap().is_none());
    }

    #[test]
    fn counts_group_by_state() {
        let (registry, _) = registry(RegistryOptions::default());
        captured(&registry, "a", 0);
        captured(&registry, "b", 15_000_000);
        registry.create_pending(&new_unit("c", 30_000_000)).unwrap();
        let counts = registry.counts().unwrap();
        assert_eq!(
            counts,
            vec![(UnitState::Pending, 1), (UnitState::Captured, 2)]
        );
    }
}
