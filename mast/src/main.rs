//! `mast-unit`: a simulated MAST unit driven from a line console
//!
//! Reads one command per line from stdin (`help` lists them) and prints each
//! command's outcome as JSON.

use anyhow::Context;
use clap::Parser;
use mast::{logging, CommandRegistry, MastConfig};
use mast_device::{SimulatedCamera, SimulatedMount};
use mast_guiding::{ExternalWorker, ProcessWorker, RequestSkew, Unit, WorkerLauncher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "mast-unit", about = "Simulated MAST unit with a guiding core")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Solving worker executable (defaults to mast-solver-sim next to this binary)
    #[arg(long)]
    solver: Option<PathBuf>,

    /// Do not launch a worker; wait for one started by hand
    #[arg(long)]
    external_worker: bool,

    /// Bias solve hints so the simulated solver reports a drift
    #[arg(long)]
    skew: bool,

    /// Write daily log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// `mast-solver-sim` from the directory this executable lives in
fn sibling_solver() -> Option<PathBuf> {
    let name = if cfg!(windows) { "mast-solver-sim.exe" } else { "mast-solver-sim" };
    let path = std::env::current_exe().ok()?.parent()?.join(name);
    path.exists().then_some(path)
}

fn print_outcome<T: serde::Serialize>(outcome: &T) {
    match serde_json::to_string_pretty(outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("cannot render outcome: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = MastConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    if args.log_dir.is_some() {
        config.logging.directory = args.log_dir.clone();
    }
    if args.skew {
        config.unit.guiding.request_skew = Some(RequestSkew::test_pattern());
    }
    if let Some(solver) = args.solver.clone() {
        config.unit.guiding.worker.program = Some(solver);
    }
    if config.unit.guiding.worker.program.is_none() && !args.external_worker {
        config.unit.guiding.worker.program = sibling_solver();
    }
    let _log_guard = logging::init(&config.logging, "mast-unit.log")?;

    let launcher: Arc<dyn WorkerLauncher> = match (&config.unit.guiding.worker.program, args.external_worker) {
        (Some(program), false) => {
            tracing::info!("solving worker: {}", program.display());
            Arc::new(ProcessWorker::new(config.unit.guiding.worker.clone()))
        }
        _ => {
            tracing::info!("solving worker: external");
            Arc::new(ExternalWorker)
        }
    };

    let simulation = &config.simulation;
    let unit = Unit::new(
        config.unit.clone(),
        Box::new(SimulatedCamera::new(simulation.camera.clone())),
        Arc::new(SimulatedMount::new("mount", simulation.mount_ra_hours, simulation.mount_dec_degs)),
        launcher,
    )
    .context("building unit")?;
    unit.start_lifespan();

    let registry = CommandRegistry::unit_commands();
    println!("{} ready; type 'help' for commands, 'quit' to exit", unit.name());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }
        if line == "?" {
            println!("{}", registry.help_text());
            continue;
        }

        match registry.dispatch_line(&unit, line).await {
            None => {}
            Some(Ok(outcome)) => print_outcome(&outcome),
            Some(Err(e)) => eprintln!("{}", e),
        }
    }

    unit.end_lifespan().await;
    Ok(())
}
