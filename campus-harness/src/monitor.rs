//! Fleet health monitoring after startup.
//!
//! Periodically re-probes every service of a ready fleet and keeps the last
//! aggregate. The monitor never fails tests; it only publishes a diagnostic
//! snapshot and flips a ready fleet between `ready` and `degraded`.

use crate::probe::HealthProber;
use campus_common::{FleetState, HealthReport, HealthStatus, MonitorConfig, ServiceDescriptor, ServiceName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// One service's view within a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub report: HealthReport,
    /// Share of failed probes in the recent window, `0.0..=1.0`.
    pub error_rate: f64,
}

/// Aggregate fleet health at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetHealthSnapshot {
    pub status: HealthStatus,
    pub services: Vec<ServiceHealth>,
    pub cycle: u64,
    pub observed_at: DateTime<Utc>,
}

impl FleetHealthSnapshot {
    pub fn unreachable_services(&self) -> Vec<ServiceName> {
        self.services
            .iter()
            .filter(|s| !s.report.is_reachable())
            .map(|s| s.report.service_name)
            .collect()
    }
}

/// Classify one service: unreachable, slow or erroring, or fine.
pub fn classify_service(service: &ServiceHealth, config: &MonitorConfig) -> HealthStatus {
    if !service.report.is_reachable() {
        HealthStatus::Unhealthy
    } else if service.report.status == HealthStatus::Degraded
        || service.report.latency_ms > config.degraded_latency_ms
        || service.error_rate > config.error_rate_threshold
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Fleet status is the worst per-service status.
pub fn aggregate(services: &[ServiceHealth], config: &MonitorConfig) -> HealthStatus {
    services
        .iter()
        .map(|service| classify_service(service, config))
        .max()
        .unwrap_or_default()
}

/// Recent probe outcomes per service (`true` = failed).
#[derive(Debug)]
struct ErrorWindows {
    window: usize,
    outcomes: HashMap<ServiceName, VecDeque<bool>>,
}

impl ErrorWindows {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: HashMap::new(),
        }
    }

    fn record(&mut self, service: ServiceName, failed: bool) -> f64 {
        let entries = self.outcomes.entry(service).or_default();
        entries.push_back(failed);
        while entries.len() > self.window {
            entries.pop_front();
        }
        let failures = entries.iter().filter(|f| **f).count();
        failures as f64 / entries.len() as f64
    }
}

struct MonitorInner {
    config: MonitorConfig,
    prober: HealthProber,
    descriptors: Vec<ServiceDescriptor>,
    windows: Mutex<ErrorWindows>,
    latest: RwLock<Option<FleetHealthSnapshot>>,
    fleet_state: Option<Arc<watch::Sender<FleetState>>>,
}

/// Background re-probing of a running fleet. Cheap to clone.
#[derive(Clone)]
pub struct FleetHealthMonitor {
    inner: Arc<MonitorInner>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for FleetHealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetHealthMonitor")
            .field("services", &self.inner.descriptors.len())
            .field("interval", &self.inner.config.interval())
            .finish_non_exhaustive()
    }
}

impl FleetHealthMonitor {
    pub fn new(
        config: MonitorConfig,
        prober: HealthProber,
        descriptors: Vec<ServiceDescriptor>,
    ) -> Self {
        let windows = ErrorWindows::new(config.error_window);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                prober,
                descriptors,
                windows: Mutex::new(windows),
                latest: RwLock::new(None),
                fleet_state: None,
            }),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Also move the fleet between `ready` and `degraded` as health changes.
    pub(crate) fn with_fleet_state(self, fleet_state: Arc<watch::Sender<FleetState>>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.fleet_state = Some(fleet_state);
                inner
            }
            Err(shared) => {
                warn!("Monitor already shared; fleet state publishing not attached");
                return Self {
                    inner: shared,
                    shutdown_tx: self.shutdown_tx,
                };
            }
        };
        Self {
            inner: Arc::new(inner),
            shutdown_tx: self.shutdown_tx,
        }
    }

    /// Start the monitoring background task.
    pub fn start(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let period = monitor.inner.config.interval();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The supervisor just verified the fleet; first re-probe waits a full period.
            ticker.tick().await;
            info!("Fleet health monitor started (interval: {:?})", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Fleet health monitor stopping");
        })
    }

    /// Stop the background task after its current cycle.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Last aggregate, if a cycle has completed.
    pub async fn latest(&self) -> Option<FleetHealthSnapshot> {
        self.inner.latest.read().await.clone()
    }

    /// Run one probe cycle now and publish the result.
    pub async fn check_now(&self) -> FleetHealthSnapshot {
        let inner = &self.inner;
        let reports = inner.prober.probe_all(&inner.descriptors).await;

        let services: Vec<ServiceHealth> = {
            let mut windows = inner.windows.lock().await;
            reports
                .into_iter()
                .map(|report| {
                    let error_rate = windows.record(report.service_name, !report.is_reachable());
                    ServiceHealth { report, error_rate }
                })
                .collect()
        };
        let status = aggregate(&services, &inner.config);

        let mut latest = inner.latest.write().await;
        let previous = latest.as_ref().map(|s| s.status);
        let snapshot = FleetHealthSnapshot {
            status,
            services,
            cycle: latest.as_ref().map_or(1, |s| s.cycle + 1),
            observed_at: Utc::now(),
        };

        if previous != Some(status) {
            match status {
                HealthStatus::Healthy => info!(cycle = snapshot.cycle, "Fleet health: healthy"),
                _ => warn!(
                    cycle = snapshot.cycle,
                    %status,
                    unreachable = ?snapshot.unreachable_services(),
                    "Fleet health changed"
                ),
            }
        } else {
            debug!(cycle = snapshot.cycle, %status, "Fleet health unchanged");
        }

        *latest = Some(snapshot.clone());
        drop(latest);
        self.publish_fleet_state(status);
        snapshot
    }

    fn publish_fleet_state(&self, status: HealthStatus) {
        let Some(sender) = &self.inner.fleet_state else {
            return;
        };
        sender.send_if_modified(|state| {
            let next = match (*state, status) {
                (FleetState::Ready, HealthStatus::Degraded | HealthStatus::Unhealthy) => {
                    FleetState::Degraded
                }
                (FleetState::Degraded, HealthStatus::Healthy) => FleetState::Ready,
                (current, _) => current,
            };
            let changed = next != *state;
            *state = next;
            changed
        });
    }
}
