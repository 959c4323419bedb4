//! Process-scoped run context.
//!
//! Created once at test-run start and shared by reference with every test
//! session; torn down once at run end.

use crate::error::HarnessResult;
use crate::gate::ReadinessGate;
use crate::identity::IdentityPool;
use crate::monitor::{FleetHealthMonitor, FleetHealthSnapshot};
use crate::session::SessionHelper;
use crate::supervisor::FleetSupervisor;
use campus_common::{HarnessConfig, ServiceDescriptor, ServiceName, descriptor_of};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a test session needs, shared across sessions.
#[derive(Debug)]
pub struct RunContext {
    pub worker_id: u16,
    pub descriptors: Vec<ServiceDescriptor>,
    pub pool: IdentityPool,
    pub gate: ReadinessGate,
    pub sessions: SessionHelper,
    monitor: Option<FleetHealthMonitor>,
}

impl RunContext {
    /// Assemble a context from parts; [`FleetRun::start`] is the usual route.
    pub fn new(
        worker_id: u16,
        descriptors: Vec<ServiceDescriptor>,
        pool: IdentityPool,
        gate: ReadinessGate,
        sessions: SessionHelper,
    ) -> Self {
        Self {
            worker_id,
            descriptors,
            pool,
            gate,
            sessions,
            monitor: None,
        }
    }

    pub fn descriptor(&self, name: ServiceName) -> ServiceDescriptor {
        self.descriptors
            .iter()
            .copied()
            .find(|d| d.name == name)
            .unwrap_or_else(|| descriptor_of(self.worker_id, name))
    }

    /// Latest fleet health snapshot, if a monitor runs and has completed a cycle.
    pub async fn fleet_health(&self) -> Option<FleetHealthSnapshot> {
        match &self.monitor {
            Some(monitor) => monitor.latest().await,
            None => None,
        }
    }
}

/// One worker's running fleet plus its shared context.
pub struct FleetRun {
    supervisor: FleetSupervisor,
    monitor: FleetHealthMonitor,
    monitor_task: Option<JoinHandle<()>>,
    context: Arc<RunContext>,
}

impl FleetRun {
    /// Start and verify the fleet, then bring up the monitor, pool and session helper.
    pub async fn start(config: &HarnessConfig, worker_id: u16) -> HarnessResult<Self> {
        let mut supervisor = FleetSupervisor::new(config.fleet.clone(), config.supervisor.clone())?;
        supervisor.start(worker_id).await?;

        let auth = descriptor_of(worker_id, ServiceName::Auth);
        let sessions = match SessionHelper::new(config.login.clone(), &auth, &config.fleet.host) {
            Ok(sessions) => sessions,
            Err(e) => {
                supervisor.stop().await;
                return Err(e);
            }
        };

        let descriptors = supervisor.descriptors().to_vec();
        let monitor = FleetHealthMonitor::new(
            config.monitor.clone(),
            supervisor.prober().clone(),
            descriptors.clone(),
        )
        .with_fleet_state(supervisor.state_publisher());
        let monitor_task = monitor.start();

        let mut context = RunContext::new(
            worker_id,
            descriptors,
            IdentityPool::from_config(&config.identities),
            supervisor.gate(),
            sessions,
        );
        context.monitor = Some(monitor.clone());

        info!(worker_id, "Fleet run started");
        Ok(Self {
            supervisor,
            monitor,
            monitor_task: Some(monitor_task),
            context: Arc::new(context),
        })
    }

    pub fn context(&self) -> Arc<RunContext> {
        self.context.clone()
    }

    pub fn monitor(&self) -> &FleetHealthMonitor {
        &self.monitor
    }

    pub fn supervisor(&self) -> &FleetSupervisor {
        &self.supervisor
    }

    /// Stop monitoring and the fleet; returns the last health snapshot.
    pub async fn teardown(mut self) -> Option<FleetHealthSnapshot> {
        self.monitor.stop();
        if let Some(task) = self.monitor_task.take()
            && let Err(e) = task.await
        {
            warn!("Fleet health monitor task failed: {}", e);
        }
        self.supervisor.stop().await;

        for (role, stats) in self.context.pool.stats() {
            if stats.reserved > 0 {
                warn!(%role, reserved = stats.reserved, "Identities still reserved at teardown");
            }
        }
        info!(worker_id = self.context.worker_id, "Fleet run torn down");
        self.monitor.latest().await
    }
}

impl Drop for FleetRun {
    fn drop(&mut self) {
        // Without teardown the spawned loop would keep probing forever.
        self.monitor.stop();
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
    }
}
