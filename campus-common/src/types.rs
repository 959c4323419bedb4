//! Common types used across harness components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One service of the platform fleet, in fixed port order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    Frontend,
    Auth,
    User,
    News,
    Course,
    Planning,
    Statistics,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frontend => "frontend",
            Self::Auth => "auth",
            Self::User => "user",
            Self::News => "news",
            Self::Course => "course",
            Self::Planning => "planning",
            Self::Statistics => "statistics",
        }
    }

    /// How readiness is probed for this service.
    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Frontend => ServiceKind::Frontend,
            _ => ServiceKind::Backend,
        }
    }

    /// Parse a service name as used on the command line and in env vars.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "frontend" => Some(Self::Frontend),
            "auth" => Some(Self::Auth),
            "user" => Some(Self::User),
            "news" => Some(Self::News),
            "course" => Some(Self::Course),
            "planning" => Some(Self::Planning),
            "statistics" => Some(Self::Statistics),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Readiness probe flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Probed via its root path; any non-5xx response counts as ready.
    Frontend,
    /// Probed via the dedicated `/health` path.
    Backend,
}

impl ServiceKind {
    pub fn probe_path(&self) -> &'static str {
        match self {
            Self::Frontend => "/",
            Self::Backend => "/health",
        }
    }
}

/// A `{service, port}` pair derived from a worker index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: ServiceName,
    pub port: u16,
}

impl ServiceDescriptor {
    pub fn kind(&self) -> ServiceKind {
        self.name.kind()
    }

    /// Base URL on the given host, e.g. `http://127.0.0.1:3001`.
    pub fn base_url(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.port)
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Three-level health scale shared by probes, the fleet monitor and the
/// per-service dependency checks.
///
/// Ordered from best to worst so `max()` implements the worst-of rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "healthy" | "ok" | "up" => Some(Self::Healthy),
            "degraded" | "warn" | "warning" => Some(Self::Degraded),
            "unhealthy" | "down" | "error" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    /// Worst of two statuses.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Result of one readiness probe. Produced fresh on every probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub service_name: ServiceName,
    pub port: u16,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        descriptor: &ServiceDescriptor,
        status: HealthStatus,
        latency_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service_name: descriptor.name,
            port: descriptor.port,
            status,
            latency_ms,
            message: message.into(),
            observed_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Reachable means the service answered at all, even if degraded.
    pub fn is_reachable(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Test-account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Teacher,
    Staff,
    Student,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Teacher, Role::Staff, Role::Student];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Staff => "staff",
            Self::Student => "student",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one worker's fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetState {
    NotStarted,
    Starting,
    Verifying,
    Ready,
    Degraded,
    ShuttingDown,
    Stopped,
    Failed,
}

impl FleetState {
    /// Tests may run against the fleet in these states.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// States the fleet never leaves for a usable one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for FleetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Verifying => "verifying",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}
