//! Worker fleet supervisor.
//!
//! Spawns one supervisory child process per worker, verifies that every
//! service of the worker answers its readiness probe in the same polling
//! round, and owns the two-phase shutdown of what it started.

use crate::error::{HarnessError, HarnessResult};
use crate::gate::ReadinessGate;
use crate::probe::HealthProber;
use campus_common::{
    FleetConfig, FleetState, HealthReport, ServiceDescriptor, ServiceName, SupervisorConfig,
    base_port, descriptors_for,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

/// A child process started by the supervisor, with its output forwarders.
#[derive(Debug)]
pub struct OwnedProcess {
    child: Child,
    pid: Option<u32>,
    forwarders: Vec<JoinHandle<()>>,
}

impl OwnedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a graceful stop, wait `grace`, then force-kill and wait `kill_timeout`.
    async fn terminate(mut self, grace: Duration, kill_timeout: Duration) {
        let pid = self.pid.unwrap_or(0);

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "Fleet process already exited");
                self.abort_forwarders();
                // The leader may be gone while the rest of its group lingers.
                signal_group(pid, "KILL").await;
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(pid, "Failed to poll fleet process: {}", e),
        }

        if !signal_group(pid, "TERM").await {
            // No group signal available; fall back to the direct kill below.
            debug!(pid, "TERM could not be delivered to process group");
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(pid, %status, "Fleet process stopped gracefully"),
            Ok(Err(e)) => warn!(pid, "Failed waiting for fleet process: {}", e),
            Err(_) => {
                warn!(pid, grace_ms = grace.as_millis() as u64, "Fleet process ignored TERM, killing");
                signal_group(pid, "KILL").await;
                if let Err(e) = self.child.start_kill() {
                    debug!(pid, "start_kill failed: {}", e);
                }
                match timeout(kill_timeout, self.child.wait()).await {
                    Ok(Ok(status)) => info!(pid, %status, "Fleet process killed"),
                    Ok(Err(e)) => warn!(pid, "Failed waiting for killed fleet process: {}", e),
                    Err(_) => warn!(pid, "Fleet process still alive after KILL"),
                }
            }
        }

        // Grandchildren that ignored TERM would otherwise outlive the leader.
        signal_group(pid, "KILL").await;
        self.abort_forwarders();
    }

    fn abort_forwarders(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for OwnedProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait()
            && let Some(pid) = self.pid
        {
            signal_group_blocking(pid, "KILL");
        }
        self.abort_forwarders();
    }
}

/// Supervises one worker's fleet.
pub struct FleetSupervisor {
    fleet: FleetConfig,
    settings: SupervisorConfig,
    prober: HealthProber,
    worker_id: Option<u16>,
    descriptors: Vec<ServiceDescriptor>,
    processes: Vec<OwnedProcess>,
    state_tx: Arc<watch::Sender<FleetState>>,
}

impl FleetSupervisor {
    pub fn new(fleet: FleetConfig, settings: SupervisorConfig) -> HarnessResult<Self> {
        let prober = HealthProber::new(fleet.host.clone(), settings.probe_timeout())?;
        let (state_tx, _) = watch::channel(FleetState::NotStarted);
        Ok(Self {
            fleet,
            settings,
            prober,
            worker_id: None,
            descriptors: Vec::new(),
            processes: Vec::new(),
            state_tx: Arc::new(state_tx),
        })
    }

    pub fn state(&self) -> FleetState {
        *self.state_tx.borrow()
    }

    pub fn worker_id(&self) -> Option<u16> {
        self.worker_id
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    /// PIDs of processes currently owned.
    pub fn pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(OwnedProcess::pid).collect()
    }

    /// Gate that resolves once this fleet is usable.
    pub fn gate(&self) -> ReadinessGate {
        ReadinessGate::new(self.state_tx.subscribe())
    }

    /// Shared handle for publishing health-driven transitions.
    pub(crate) fn state_publisher(&self) -> Arc<watch::Sender<FleetState>> {
        self.state_tx.clone()
    }

    fn set_state(&self, state: FleetState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(worker_id = ?self.worker_id, from = %previous, to = %state, "Fleet state changed");
        }
    }

    /// Start and verify the fleet for `worker_id`.
    ///
    /// Any failure tears down what was started before the error is returned.
    pub async fn start(&mut self, worker_id: u16) -> HarnessResult<FleetState> {
        let current = self.state();
        if matches!(
            current,
            FleetState::Starting | FleetState::Verifying | FleetState::Ready | FleetState::Degraded
        ) {
            warn!(worker_id, state = %current, "Fleet already started");
            return Ok(current);
        }

        self.worker_id = Some(worker_id);
        self.descriptors = descriptors_for(worker_id);
        self.set_state(FleetState::Starting);
        info!(
            worker_id,
            base_port = base_port(worker_id),
            services = self.descriptors.len(),
            program = %self.fleet.program,
            "Starting fleet"
        );

        let result = match self.spawn_fleet(worker_id) {
            Ok(process) => {
                self.processes.push(process);
                self.set_state(FleetState::Verifying);
                self.verify(worker_id).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(rounds) => {
                self.set_state(FleetState::Ready);
                info!(worker_id, rounds, "Fleet ready");
                Ok(FleetState::Ready)
            }
            Err(e) => {
                warn!(worker_id, "Fleet startup failed: {}", e);
                self.set_state(FleetState::Failed);
                self.stop().await;
                Err(e)
            }
        }
    }

    fn spawn_fleet(&self, worker_id: u16) -> HarnessResult<OwnedProcess> {
        let mut command = Command::new(&self.fleet.program);
        command
            .args(&self.fleet.args)
            .envs(&self.fleet.env)
            .env("CAMPUS_WORKER_ID", worker_id.to_string())
            .env("CAMPUS_BASE_PORT", base_port(worker_id).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for descriptor in &self.descriptors {
            command.env(
                format!("CAMPUS_PORT_{}", descriptor.name.as_str().to_ascii_uppercase()),
                descriptor.port.to_string(),
            );
        }
        if let Some(dir) = &self.fleet.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            program: self.fleet.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(worker_id, pid = pid.unwrap_or(0), "Fleet process spawned");

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_milestones(stdout, "stdout", worker_id, self.fleet.milestones.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_milestones(stderr, "stderr", worker_id, self.fleet.milestones.clone()));
        }

        Ok(OwnedProcess {
            child,
            pid,
            forwarders,
        })
    }

    /// Poll every service until one round is all healthy or the budget runs out.
    ///
    /// The budget bounds the whole verification, including a round stuck on
    /// hung services.
    async fn verify(&mut self, worker_id: u16) -> HarnessResult<u32> {
        let budget = self.settings.startup_budget();
        let deadline = Instant::now() + budget;
        let mut progress = VerifyProgress {
            rounds: 0,
            unhealthy: self.descriptors.iter().map(|d| d.name).collect(),
            last_reports: Vec::new(),
        };

        match timeout_at(deadline, self.poll_until_healthy(worker_id, &mut progress)).await {
            Ok(result) => result,
            Err(_) => {
                for report in progress.last_reports.iter().filter(|r| !r.is_healthy()) {
                    warn!(
                        worker_id,
                        service = %report.service_name,
                        port = report.port,
                        "Never became healthy: {}",
                        report.message
                    );
                }
                Err(HarnessError::StartupTimeout {
                    worker_id,
                    unhealthy: progress.unhealthy,
                    rounds: progress.rounds,
                    budget,
                })
            }
        }
    }

    async fn poll_until_healthy(&mut self, worker_id: u16, progress: &mut VerifyProgress) -> HarnessResult<u32> {
        let mut ticker = interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            progress.rounds += 1;

            if let Some(status) = self.exited_child() {
                return Err(HarnessError::ChildExited {
                    worker_id,
                    status,
                    unhealthy: progress.unhealthy.clone(),
                });
            }

            let reports = self.prober.probe_all(&self.descriptors).await;
            progress.unhealthy = not_healthy(&reports);
            progress.last_reports = reports;
            if progress.unhealthy.is_empty() {
                return Ok(progress.rounds);
            }
            trace!(worker_id, rounds = progress.rounds, pending = ?progress.unhealthy, "Fleet not ready yet");
        }
    }

    fn exited_child(&mut self) -> Option<String> {
        self.processes.iter_mut().find_map(|process| match process.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        })
    }

    /// Two-phase shutdown of every owned process. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.processes.is_empty() {
            if !matches!(self.state(), FleetState::NotStarted | FleetState::Stopped) {
                self.set_state(FleetState::Stopped);
            }
            return;
        }

        self.set_state(FleetState::ShuttingDown);
        let grace = self.settings.grace_period();
        let kill_timeout = self.settings.kill_timeout();
        let processes: Vec<OwnedProcess> = self.processes.drain(..).collect();
        futures::future::join_all(
            processes
                .into_iter()
                .map(|process| process.terminate(grace, kill_timeout)),
        )
        .await;

        self.set_state(FleetState::Stopped);
        info!(worker_id = ?self.worker_id, "Fleet stopped");
    }
}

/// What the last completed polling round saw.
struct VerifyProgress {
    rounds: u32,
    unhealthy: Vec<ServiceName>,
    last_reports: Vec<HealthReport>,
}

fn not_healthy(reports: &[HealthReport]) -> Vec<ServiceName> {
    reports
        .iter()
        .filter(|report| !report.is_healthy())
        .map(|report| report.service_name)
        .collect()
}

/// Forward child output lines that contain a milestone marker.
fn forward_milestones<R>(
    stream: R,
    label: &'static str,
    worker_id: u16,
    milestones: Vec<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if milestones.iter().any(|marker| line.contains(marker.as_str())) {
                        info!(worker_id, stream = label, "{}", line);
                    } else {
                        trace!(worker_id, stream = label, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(worker_id, stream = label, "Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Signal the process group led by `pid`.
async fn signal_group(pid: u32, signal: &str) -> bool {
    if pid == 0 || !cfg!(unix) {
        return false;
    }
    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send {} to process group {}: {}", signal, pid, e);
            false
        }
    }
}

fn signal_group_blocking(pid: u32, signal: &str) {
    if pid == 0 || !cfg!(unix) {
        return;
    }
    if let Err(e) = std::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        debug!("Failed to send {} to process group {}: {}", signal, pid, e);
    }
}

/// Whether a process with this PID still runs. A zombie awaiting its reaper counts as gone.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    if cfg!(target_os = "linux") {
        return match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => proc_state(&stat).is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        };
    }

    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// State letter from a `/proc/<pid>/stat` line; the command name may contain spaces or parens.
fn proc_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}
