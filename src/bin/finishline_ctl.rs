//! finishline_ctl - inspect and operate the work unit registry

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use finishline::config::PipelineConfig;
use finishline::storage::open_object_store;
use finishline::{NewWorkUnit, SqliteRegistry, UnitRegistry, UnitState, MICROS_PER_SECOND};

const REQUEUE_BATCH: usize = 10_000;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML or JSON); environment variables override it.
    #[arg(long, env = "FINISHLINE_CONFIG")]
    config: Option<PathBuf>,
    /// Registry database, overriding the configured one.
    #[arg(long)]
    db_path: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a unit with its crossing events and clips.
    Status {
        #[arg(long)]
        unit: String,
    },
    /// List units, oldest first.
    List {
        /// Only units in this state (e.g. FAILED).
        #[arg(long)]
        state: Option<UnitState>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Number of units per state.
    Counts,
    /// State transitions of a unit.
    History {
        #[arg(long)]
        unit: String,
    },
    /// Crossing events recorded after a feed cursor.
    Events {
        #[arg(long, default_value_t = 0)]
        since: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Register a segment that is already in storage as CAPTURED.
    Register {
        #[arg(long)]
        segment_id: String,
        /// Wall-clock start of the segment in microseconds since the epoch.
        #[arg(long)]
        start_us: i64,
        #[arg(long)]
        duration_ms: u64,
        #[arg(long, default_value_t = 10.0)]
        fps: f64,
        /// Storage key of the segment.
        #[arg(long)]
        location: String,
    },
    /// Move FAILED units back to the state before the stage that failed.
    Requeue {
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        unit: Option<String>,
        /// Requeue every retryable FAILED unit.
        #[arg(long)]
        all: bool,
    },
    /// Fail CAPTURING units whose capture process died with the lease.
    Reap,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    let registry = SqliteRegistry::open(&config.db_path, config.registry_options())?;

    let output = match args.command {
        Command::Status { unit } => serde_json::to_value(registry.status(&unit)?)?,
        Command::List { state, limit } => serde_json::to_value(registry.list(state, limit)?)?,
        Command::Counts => {
            let counts: serde_json::Map<String, serde_json::Value> = registry
                .counts()?
                .into_iter()
                .map(|(state, count)| (state.to_string(), json!(count)))
                .collect();
            serde_json::Value::Object(counts)
        }
        Command::History { unit } => serde_json::to_value(registry.history(&unit)?)?,
        Command::Events { since, limit } => {
            let records = registry.events_since(since, limit)?;
            let cursor = records.last().map(|r| r.seq).unwrap_or(since);
            json!({ "cursor": cursor, "events": records })
        }
        Command::Register {
            segment_id,
            start_us,
            duration_ms,
            fps,
            location,
        } => {
            let store = open_object_store(&config.storage)?;
            if !store.exists(&location)? {
                return Err(anyhow!(
                    "segment {} not found in {}",
                    location,
                    store.describe()
                ));
            }
            let duration_us = i64::try_from(duration_ms)
                .ok()
                .and_then(|ms| ms.checked_mul(MICROS_PER_SECOND / 1_000))
                .ok_or_else(|| anyhow!("duration_ms out of range"))?;
            let unit = registry.register_captured(
                &NewWorkUnit {
                    id: segment_id,
                    event_id: config.event_id.clone(),
                    start_us,
                    duration_us,
                    frame_rate: fps,
                },
                &location,
            )?;
            serde_json::to_value(unit)?
        }
        Command::Reap => {
            let failed: Vec<String> = registry
                .fail_expired_captures()?
                .into_iter()
                .map(|unit| unit.id)
                .collect();
            json!({ "failed": failed })
        }
        Command::Requeue { unit: Some(unit), .. } => {
            serde_json::to_value(registry.requeue_failed(&unit)?)?
        }
        Command::Requeue { unit: None, .. } => {
            let mut requeued = Vec::new();
            let mut skipped = Vec::new();
            for unit in registry.list(Some(UnitState::Failed), REQUEUE_BATCH)? {
                match registry.requeue_failed(&unit.id) {
                    Ok(unit) => requeued.push(unit.id),
                    Err(err) => {
                        log::warn!("finishline_ctl: {} not requeued: {}", unit.id, err);
                        skipped.push(json!({ "unit": unit.id, "reason": err.to_string() }));
                    }
                }
            }
            json!({ "requeued": requeued, "skipped": skipped })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
