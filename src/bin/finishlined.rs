//! finishlined - finish-line pipeline worker daemon
//!
//! One process runs one mode:
//! 1. `capture`: read the configured stream and write segments
//! 2. `filter`: discard or trim captured segments
//! 3. `detect`: emit line crossings (and assemble clips inline by default)
//! 4. `assemble`: cut clips for detected units
//!
//! Processes coordinate only through the registry database, so any number of
//! each mode may run against the same `db_path` and storage root.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use finishline::config::PipelineConfig;
use finishline::worker::{self, WorkerContext, WorkerMode};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Pipeline role for this process.
    #[arg(long, value_enum, env = "FINISHLINE_MODE")]
    mode: WorkerMode,
    /// Config file (TOML or JSON); environment variables override it.
    #[arg(long, env = "FINISHLINE_CONFIG")]
    config: Option<PathBuf>,
    /// Worker identity recorded on claims (defaults to host-pid-random).
    #[arg(long, env = "FINISHLINE_WORKER_ID")]
    worker_id: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = PipelineConfig::load_from(args.config.as_deref())?;
    let worker_id = args.worker_id.unwrap_or_else(worker::default_worker_id);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "finishlined {} starting as {} worker {} (event {})",
        env!("CARGO_PKG_VERSION"),
        args.mode,
        worker_id,
        config.event_id
    );
    let ctx = WorkerContext::open(config, worker_id, shutdown)?;
    worker::run(&ctx, args.mode)?;
    log::info!("finishlined stopped");
    Ok(())
}
