//! campus-fleet - operator CLI for worker fleets
//!
//! Prints a worker's port table, probes a running fleet once, or brings a
//! fleet up under supervision until interrupted.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use campus_common::{
    HarnessConfig, LogConfig, MAX_WORKER_ID, descriptors_for, init_logging, resolve_worker_index,
};
use campus_harness::{FleetRun, HealthProber};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "campus-fleet")]
#[command(author, version, about = "Campus test harness - worker fleet control")]
struct Cli {
    /// Worker index (defaults to CAMPUS_WORKER_ID / TEST_WORKER_INDEX / TEST_PARALLEL_INDEX, else 0)
    #[arg(short, long, global = true, value_parser = clap::value_parser!(u16).range(..=MAX_WORKER_ID as i64))]
    worker: Option<u16>,

    /// Path to harness configuration
    #[arg(short, long, global = true, env = "CAMPUS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the service/port table for a worker
    Ports {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Probe every service of a worker once
    Probe {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a fleet, wait for readiness and monitor it until ctrl-c
    Up,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let _guards = init_logging(&LogConfig::from_env(default_level))?;

    let worker_id = cli.worker.unwrap_or_else(resolve_worker_index);
    let config = HarnessConfig::load(cli.config.as_deref()).context("loading harness configuration")?;

    match cli.command {
        Command::Ports { json } => ports(worker_id, json),
        Command::Probe { json } => probe(&config, worker_id, json).await,
        Command::Up => up(&config, worker_id).await,
    }
}

fn ports(worker_id: u16, json: bool) -> Result<ExitCode> {
    let descriptors = descriptors_for(worker_id);
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
    } else {
        println!("worker {worker_id}");
        for descriptor in descriptors {
            println!("  {:<12} {}", descriptor.name, descriptor.port);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn probe(config: &HarnessConfig, worker_id: u16, json: bool) -> Result<ExitCode> {
    let prober = HealthProber::new(config.fleet.host.clone(), config.supervisor.probe_timeout())?;
    let reports = prober.probe_all(&descriptors_for(worker_id)).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!(
                "  {:<12} {:>5}  {:<9} {:>5}ms  {}",
                report.service_name, report.port, report.status, report.latency_ms, report.message
            );
        }
    }

    if reports.iter().all(|r| r.is_healthy()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn up(config: &HarnessConfig, worker_id: u16) -> Result<ExitCode> {
    let run = FleetRun::start(config, worker_id)
        .await
        .with_context(|| format!("starting fleet for worker {worker_id}"))?;
    info!(worker_id, "Fleet is up; press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }

    // Bounded so a wedged child cannot hold the terminal hostage.
    let limit = config.supervisor.grace_period() + config.supervisor.kill_timeout() + Duration::from_secs(5);
    match tokio::time::timeout(limit, run.teardown()).await {
        Ok(Some(snapshot)) => {
            info!(status = %snapshot.status, cycle = snapshot.cycle, "Final fleet health");
            Ok(ExitCode::SUCCESS)
        }
        Ok(None) => Ok(ExitCode::SUCCESS),
        Err(_) => {
            warn!("Teardown did not finish within {:?}", limit);
            Ok(ExitCode::FAILURE)
        }
    }
}
