//! Binary-level tests for campus-stub.

use campus_common::{FleetConfig, FleetState, ServiceName, SupervisorConfig, descriptor_of};
use campus_harness::{FleetSupervisor, HarnessError, is_process_alive};
use serial_test::serial;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const STUB_BIN: &str = env!("CARGO_BIN_EXE_campus-stub");

fn supervisor_settings() -> SupervisorConfig {
    SupervisorConfig {
        poll_interval_ms: 50,
        startup_budget_ms: 5_000,
        grace_period_ms: 2_000,
        kill_timeout_ms: 1_000,
        probe_timeout_ms: 500,
    }
}

#[test]
fn test_help_lists_options() {
    let output = std::process::Command::new(STUB_BIN)
        .arg("--help")
        .output()
        .expect("run campus-stub --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--worker"));
    assert!(stdout.contains("--down"));
}

#[test]
fn test_rejects_unknown_service() {
    let output = std::process::Command::new(STUB_BIN)
        .args(["--down", "library"])
        .output()
        .expect("run campus-stub");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown service"));
}

#[test]
fn test_rejects_worker_beyond_port_range() {
    let output = std::process::Command::new(STUB_BIN)
        .args(["--worker", "7000"])
        .output()
        .expect("run campus-stub");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--worker"));
}

#[tokio::test]
#[serial]
async fn test_prints_ready_milestones_and_stops_on_term() {
    let mut child = Command::new(STUB_BIN)
        .args(["--worker", "51", "--down", "planning"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("spawn campus-stub");

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let mut ready = Vec::new();
    while ready.len() < 6 {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("milestone in time")
            .expect("readable stdout")
            .expect("stub exited early");
        if line.starts_with("ready:") {
            ready.push(line);
        }
    }
    assert!(ready.iter().all(|l| !l.contains("planning")));
    let auth_port = descriptor_of(51, ServiceName::Auth).port;
    assert!(ready.iter().any(|l| l == &format!("ready: auth listening on {auth_port}")));

    let health = reqwest::get(format!(
        "http://127.0.0.1:{}/health",
        descriptor_of(51, ServiceName::News).port
    ))
    .await
    .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let pid = child.id().expect("pid");
    let status = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    let exit = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("stub stops on TERM")
        .unwrap();
    assert!(exit.success());
}

#[tokio::test]
#[serial]
async fn test_supervisor_drives_stub_fleet() {
    let fleet = FleetConfig {
        program: STUB_BIN.to_string(),
        ..FleetConfig::default()
    };
    let mut supervisor = FleetSupervisor::new(fleet, supervisor_settings()).unwrap();

    assert_eq!(supervisor.start(52).await.unwrap(), FleetState::Ready);
    let pids = supervisor.pids();
    supervisor.stop().await;
    assert_eq!(supervisor.state(), FleetState::Stopped);
    for pid in pids {
        assert!(!is_process_alive(pid));
    }
}

#[tokio::test]
#[serial]
async fn test_supervisor_reports_unhealthy_stub_service() {
    let fleet = FleetConfig {
        program: STUB_BIN.to_string(),
        args: vec!["--unhealthy".to_string(), "statistics".to_string()],
        ..FleetConfig::default()
    };
    let settings = SupervisorConfig {
        startup_budget_ms: 1_500,
        ..supervisor_settings()
    };
    let mut supervisor = FleetSupervisor::new(fleet, settings).unwrap();

    let err = supervisor.start(53).await.unwrap_err();
    assert!(matches!(err, HarnessError::StartupTimeout { .. }), "{err}");
    assert_eq!(err.unhealthy_services(), &[ServiceName::Statistics]);
    assert!(supervisor.pids().is_empty());
}
