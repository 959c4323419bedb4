//! Shared fixtures for harness integration tests.

#![allow(dead_code)]

use campus_common::{
    FleetConfig, HarnessConfig, LoginConfig, MonitorConfig, ServiceName, SupervisorConfig,
    descriptors_for,
};
use campus_harness::{StubBehavior, StubHandle, StubService};

pub use campus_common::testing::{TestPhase, init_test_logging};

/// Config whose fleet program just idles; services are in-process stubs.
pub fn stub_backed_config() -> HarnessConfig {
    HarnessConfig {
        fleet: FleetConfig {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            ..FleetConfig::default()
        },
        supervisor: SupervisorConfig {
            poll_interval_ms: 50,
            startup_budget_ms: 3_000,
            grace_period_ms: 1_000,
            kill_timeout_ms: 1_000,
            probe_timeout_ms: 500,
        },
        monitor: MonitorConfig {
            interval_ms: 100,
            ..MonitorConfig::default()
        },
        login: LoginConfig {
            base_delay_ms: 5,
            max_jitter_ms: 5,
            attempt_timeout_ms: 2_000,
            ..LoginConfig::default()
        },
        ..HarnessConfig::default()
    }
}

/// Bring up stubs for every service of `worker_id` except `skip`.
pub async fn spawn_stubs(worker_id: u16, skip: &[ServiceName]) -> Vec<StubHandle> {
    let mut handles = Vec::new();
    for descriptor in descriptors_for(worker_id) {
        if skip.contains(&descriptor.name) {
            continue;
        }
        let handle = StubService::spawn(descriptor, StubBehavior::default())
            .await
            .unwrap_or_else(|e| panic!("failed to bind {descriptor}: {e}"));
        handles.push(handle);
    }
    handles
}

/// Remove and return the stub serving `name`.
pub fn take_stub(handles: &mut Vec<StubHandle>, name: ServiceName) -> StubHandle {
    let index = handles
        .iter()
        .position(|h| h.descriptor().name == name)
        .unwrap_or_else(|| panic!("no stub for {name}"));
    handles.remove(index)
}

pub async fn shutdown_all(handles: Vec<StubHandle>) {
    for handle in handles {
        handle.shutdown().await;
    }
}
