//! End-to-end fleet scenarios against in-process stub services.
//!
//! The supervised child is a plain `sleep`; readiness comes from stubs
//! bound on the worker's namespaced ports.

mod common;

use campus_common::{FleetState, HealthStatus, Role, ServiceName};
use campus_harness::{
    FleetRun, FleetSupervisor, HarnessError, TestSession, is_process_alive,
};
use common::{TestPhase, init_test_logging, shutdown_all, spawn_stubs, stub_backed_config, take_stub};
use serial_test::serial;
use std::time::Duration;
use tracing::info;

#[tokio::test]
#[serial]
async fn test_worker0_ready_then_monitor_reports_killed_service() {
    init_test_logging();
    info!(phase = %TestPhase::Setup, "starting worker 0 stubs on 3000-3006");
    let mut stubs = spawn_stubs(0, &[]).await;
    let config = stub_backed_config();

    let run = FleetRun::start(&config, 0).await.expect("fleet should become ready");
    assert_eq!(run.supervisor().state(), FleetState::Ready);
    let context = run.context();
    assert!(context.gate.is_ready());

    info!(phase = %TestPhase::Execute, "killing the stub on port 3004");
    let course = take_stub(&mut stubs, ServiceName::Course);
    assert_eq!(course.descriptor().port, 3004);
    course.shutdown().await;

    let snapshot = run.monitor().check_now().await;
    assert_eq!(snapshot.status, HealthStatus::Unhealthy);
    assert_eq!(snapshot.unreachable_services(), vec![ServiceName::Course]);

    info!(phase = %TestPhase::Verify, "waiting for the background cycle");
    let observed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(latest) = context.fleet_health().await
                && latest.cycle > snapshot.cycle
                && latest.status == HealthStatus::Unhealthy
            {
                return latest;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("monitor should publish another unhealthy cycle");
    assert_eq!(observed.unreachable_services(), vec![ServiceName::Course]);
    assert_eq!(context.gate.state(), FleetState::Degraded);

    info!(phase = %TestPhase::Teardown, "tearing down");
    let last = run.teardown().await.expect("monitor ran at least one cycle");
    assert_eq!(last.status, HealthStatus::Unhealthy);
    assert_eq!(context.gate.state(), FleetState::Stopped);
    shutdown_all(stubs).await;
}

#[tokio::test]
#[serial]
async fn test_startup_timeout_names_exactly_the_missing_service() {
    init_test_logging();
    let stubs = spawn_stubs(41, &[ServiceName::News]).await;
    let mut config = stub_backed_config();
    config.supervisor.startup_budget_ms = 500;

    let mut supervisor = FleetSupervisor::new(config.fleet.clone(), config.supervisor.clone()).unwrap();
    let err = supervisor.start(41).await.unwrap_err();

    match &err {
        HarnessError::StartupTimeout {
            worker_id,
            unhealthy,
            rounds,
            ..
        } => {
            assert_eq!(*worker_id, 41);
            assert_eq!(unhealthy, &vec![ServiceName::News]);
            assert!(*rounds > 1);
        }
        other => panic!("expected startup timeout, got {other}"),
    }
    assert!(err.to_string().contains("news"));
    assert_eq!(supervisor.state(), FleetState::Stopped);
    assert!(supervisor.pids().is_empty());
    shutdown_all(stubs).await;
}

#[tokio::test]
#[serial]
async fn test_stop_twice_leaves_no_live_process() {
    init_test_logging();
    let stubs = spawn_stubs(42, &[]).await;
    let config = stub_backed_config();

    let mut supervisor = FleetSupervisor::new(config.fleet.clone(), config.supervisor.clone()).unwrap();
    assert_eq!(supervisor.start(42).await.unwrap(), FleetState::Ready);
    let pids = supervisor.pids();
    assert_eq!(pids.len(), 1);
    assert!(pids.iter().all(|pid| is_process_alive(*pid)));

    supervisor.stop().await;
    supervisor.stop().await;

    assert_eq!(supervisor.state(), FleetState::Stopped);
    assert!(supervisor.pids().is_empty());
    for pid in pids {
        assert!(!is_process_alive(pid), "process {pid} survived stop()");
    }
    shutdown_all(stubs).await;
}

#[tokio::test]
#[serial]
async fn test_session_logs_in_and_releases_identity() {
    init_test_logging();
    let stubs = spawn_stubs(43, &[]).await;
    let run = FleetRun::start(&stub_backed_config(), 43).await.unwrap();
    let context = run.context();

    let mut session = TestSession::begin(context.clone(), "session-flow");
    let teacher = session.login(Role::Teacher).await.unwrap();
    assert!(teacher.tokens.is_some());
    assert_eq!(
        context.pool.get(teacher.id).and_then(|r| r.tokens),
        teacher.tokens
    );

    let me = session
        .client(&teacher, ServiceName::Auth)
        .unwrap()
        .get("/api/auth/me")
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = me.json().await.unwrap();
    assert_eq!(body["data"]["email"], teacher.email.as_str());

    assert_eq!(session.end(), 1);
    assert_eq!(context.pool.stats()[&Role::Teacher].reserved, 0);
    assert!(context.pool.get(teacher.id).unwrap().tokens.is_none());

    run.teardown().await;
    shutdown_all(stubs).await;
}

#[tokio::test]
#[serial]
async fn test_dropped_run_stops_monitoring_and_fleet() {
    init_test_logging();
    let stubs = spawn_stubs(44, &[]).await;
    let run = FleetRun::start(&stub_backed_config(), 44).await.unwrap();
    let monitor = run.monitor().clone();
    let pids = run.supervisor().pids();

    let first = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = monitor.latest().await {
                return snapshot.cycle;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("monitor completes a cycle");
    assert!(first >= 1);

    drop(run);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = monitor.latest().await.map(|s| s.cycle);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(monitor.latest().await.map(|s| s.cycle), settled, "monitor kept probing");

    let gone = tokio::time::timeout(Duration::from_secs(2), async {
        while pids.iter().any(|pid| is_process_alive(*pid)) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "fleet process survived drop");
    shutdown_all(stubs).await;
}
