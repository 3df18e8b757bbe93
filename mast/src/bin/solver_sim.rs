//! `mast-solver-sim`: simulated solving worker
//!
//! Connects to a guiding coordinator, attaches its shared image buffer and
//! answers every solve request with the hint coordinates plus an optional
//! fixed drift.

use anyhow::Context;
use clap::Parser;
use mast::{logging, LoggingConfig};
use mast_guiding::{default_buffer_dir, EchoSolver, SolverClient, SolverClientConfig, DEFAULT_BUFFER_NAME};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mast-solver-sim", about = "Simulated plate-solving worker")]
struct Args {
    /// Coordinator address
    #[arg(long)]
    connect: SocketAddr,

    /// Shared image buffer name
    #[arg(long, default_value = DEFAULT_BUFFER_NAME)]
    buffer: String,

    /// Directory backing the shared buffer
    #[arg(long)]
    buffer_dir: Option<PathBuf>,

    /// Drift added to every solution, RA hours
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    drift_ra_hours: f64,

    /// Drift added to every solution, Dec degrees
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    drift_dec_degs: f64,

    /// Simulated solve time
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Write daily log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(
        &LoggingConfig {
            directory: args.log_dir.clone(),
            ..LoggingConfig::default()
        },
        "mast-solver-sim.log",
    )?;

    let mut solver = EchoSolver::new().with_delay(Duration::from_millis(args.delay_ms));
    if args.drift_ra_hours != 0.0 || args.drift_dec_degs != 0.0 {
        solver = solver.with_drift(args.drift_ra_hours, args.drift_dec_degs);
    }

    let client = SolverClient::new(
        SolverClientConfig {
            coordinator: args.connect,
            buffer_dir: args.buffer_dir.unwrap_or_else(default_buffer_dir),
            buffer_name: args.buffer,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        },
        solver,
    );
    client.run().await.context("solving worker failed")?;
    Ok(())
}
