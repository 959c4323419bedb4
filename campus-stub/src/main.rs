//! campus-stub - stand-in service fleet
//!
//! Serves every service of one worker on its namespaced port so the fleet
//! supervisor can be exercised without the real platform.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use campus_common::{HealthStatus, LogConfig, MAX_WORKER_ID, ServiceName, descriptors_for, init_logging};
use campus_harness::{HealthSource, StubBehavior, StubCredentials, StubService};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "campus-stub")]
#[command(author, version, about = "Campus stub fleet - fake services for harness testing")]
struct Cli {
    /// Worker index whose ports to serve
    #[arg(
        short,
        long,
        env = "CAMPUS_WORKER_ID",
        default_value = "0",
        value_parser = clap::value_parser!(u16).range(..=MAX_WORKER_ID as i64)
    )]
    worker: u16,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Services to leave unbound (repeatable)
    #[arg(long = "down", value_parser = parse_service)]
    down: Vec<ServiceName>,

    /// Services whose /health answers 503 (repeatable)
    #[arg(long = "unhealthy", value_parser = parse_service)]
    unhealthy: Vec<ServiceName>,

    /// Password accepted for any account by the auth service
    #[arg(long)]
    password: Option<String>,

    /// Database address checked by /health (enables live dependency checks)
    #[arg(long)]
    db_addr: Option<String>,

    /// Directory used for the disk latency check
    #[arg(long)]
    disk_dir: Option<PathBuf>,

    /// Number of initial login requests answered with 503
    #[arg(long, default_value = "0")]
    flaky_logins: u32,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_service(value: &str) -> Result<ServiceName, String> {
    ServiceName::parse(value).ok_or_else(|| format!("unknown service '{value}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let _guards = init_logging(&LogConfig::from_env(default_level))?;

    let mut base = StubBehavior {
        transient_login_failures: cli.flaky_logins,
        ..StubBehavior::default()
    };
    if let Some(password) = &cli.password {
        base.credentials = StubCredentials::SharedPassword(password.clone());
    }
    if cli.db_addr.is_some() || cli.disk_dir.is_some() {
        base.health_source = HealthSource::Checks {
            db_addr: cli.db_addr.clone(),
            disk_dir: cli.disk_dir.clone().unwrap_or_else(std::env::temp_dir),
        };
    }

    let mut handles = Vec::new();
    for descriptor in descriptors_for(cli.worker) {
        if cli.down.contains(&descriptor.name) {
            info!(service = %descriptor.name, port = descriptor.port, "Leaving service down");
            continue;
        }
        let mut behavior = base.clone();
        if cli.unhealthy.contains(&descriptor.name) {
            behavior.health = HealthStatus::Unhealthy;
            behavior.health_source = HealthSource::Fixed;
        }
        let handle = StubService::spawn_on(&cli.host, descriptor, behavior)
            .await
            .with_context(|| format!("binding {} on port {}", descriptor.name, descriptor.port))?;
        println!("ready: {} listening on {}", descriptor.name, descriptor.port);
        handles.push(handle);
    }

    wait_for_shutdown().await;
    info!(worker = cli.worker, "Shutting down stub fleet");
    for handle in handles {
        handle.shutdown().await;
    }
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for ctrl-c: {}", e);
                        }
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}
