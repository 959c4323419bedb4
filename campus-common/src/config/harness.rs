//! Harness configuration file (`harness.toml`).

use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::env::{EnvError, EnvParser};

/// Errors loading or validating the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub identities: IdentityConfig,
    #[serde(default)]
    pub login: LoginConfig,
}

/// How one worker's fleet is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Program started once per worker; it brings up every service.
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Host the services listen on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Child output lines containing one of these are forwarded to the log.
    #[serde(default = "default_milestones")]
    pub milestones: Vec<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            host: default_host(),
            milestones: default_milestones(),
        }
    }
}

/// Startup verification and shutdown timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Hard ceiling on startup verification.
    #[serde(default = "default_startup_budget_ms")]
    pub startup_budget_ms: u64,
    /// Wait after the graceful signal before force-killing.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    /// Per-request timeout for every readiness probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            startup_budget_ms: default_startup_budget_ms(),
            grace_period_ms: default_grace_period_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn startup_budget(&self) -> Duration {
        Duration::from_millis(self.startup_budget_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }
}

/// Background fleet monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
    /// Probe latency above which a reachable service counts as degraded.
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
    /// Number of recent probes kept per service for the error rate.
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    /// Error rate (0.0-1.0) above which a reachable service is degraded.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval_ms(),
            degraded_latency_ms: default_degraded_latency_ms(),
            error_window: default_error_window(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// A pre-provisioned test account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedAccount {
    pub role: Role,
    pub email: String,
    pub password: String,
}

/// Identity pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Domain used for synthesized accounts.
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
    /// Password for synthesized accounts.
    #[serde(default = "default_password")]
    pub default_password: String,
    #[serde(default)]
    pub seed: Vec<SeedAccount>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            email_domain: default_email_domain(),
            default_password: default_password(),
            seed: Role::ALL
                .iter()
                .map(|role| SeedAccount {
                    role: *role,
                    email: format!("{}@{}", role, default_email_domain()),
                    password: default_password(),
                })
                .collect(),
        }
    }
}

/// Login flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Login endpoint path on the auth service.
    #[serde(default = "default_login_path")]
    pub path: String,
    /// Redirect target that signals a successful login.
    #[serde(default = "default_success_location")]
    pub success_location: String,
    #[serde(default = "default_access_cookie")]
    pub access_cookie: String,
    #[serde(default = "default_refresh_cookie")]
    pub refresh_cookie: String,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Optional wall-clock ceiling across all attempts.
    #[serde(default)]
    pub max_total_ms: Option<u64>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            path: default_login_path(),
            success_location: default_success_location(),
            access_cookie: default_access_cookie(),
            refresh_cookie: default_refresh_cookie(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_total_ms: None,
        }
    }
}

impl LoginConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    /// Retry policy derived from the login settings.
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.base_delay_ms.saturating_mul(8)),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
            max_total: self.max_total_ms.map(Duration::from_millis),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from an explicit path, `$CAMPUS_CONFIG`, or the
    /// user config directory, falling back to defaults when none exists.
    /// Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::locate(path) {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No harness config found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn locate(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var("CAMPUS_CONFIG")
            && !path.trim().is_empty()
        {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("campus").join("harness.toml"))
            .filter(|candidate| candidate.is_file())
    }

    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `CAMPUS_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();

        self.supervisor.poll_interval_ms =
            parser.get_duration_ms("POLL_INTERVAL_MS", self.supervisor.poll_interval_ms);
        self.supervisor.startup_budget_ms =
            parser.get_duration_ms("STARTUP_BUDGET_MS", self.supervisor.startup_budget_ms);
        self.supervisor.grace_period_ms =
            parser.get_duration_ms("GRACE_PERIOD_MS", self.supervisor.grace_period_ms);
        self.monitor.interval_ms =
            parser.get_duration_ms("MONITOR_INTERVAL_MS", self.monitor.interval_ms);
        self.login.max_attempts =
            parser.get_u32_range("LOGIN_MAX_ATTEMPTS", self.login.max_attempts, 1, 20);
        if let Some(program) = parser.get_string("FLEET_PROGRAM") {
            self.fleet.program = program;
        }

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }

    /// Reject settings the harness cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet.program.trim().is_empty() {
            return Err(ConfigError::Invalid("fleet.program is empty".to_string()));
        }
        if self.supervisor.startup_budget_ms < self.supervisor.poll_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "supervisor.startup_budget_ms ({}) is shorter than poll_interval_ms ({})",
                self.supervisor.startup_budget_ms, self.supervisor.poll_interval_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.monitor.error_rate_threshold) {
            return Err(ConfigError::Invalid(format!(
                "monitor.error_rate_threshold must be within 0.0..=1.0, got {}",
                self.monitor.error_rate_threshold
            )));
        }
        if self.monitor.error_window == 0 {
            return Err(ConfigError::Invalid(
                "monitor.error_window must be at least 1".to_string(),
            ));
        }
        if !self.login.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "login.path must start with '/', got '{}'",
                self.login.path
            )));
        }
        Ok(())
    }
}

fn default_program() -> String {
    "npm".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_milestones() -> Vec<String> {
    ["listening", "ready", "error", "panic", "EADDRINUSE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_startup_budget_ms() -> u64 {
    60_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_kill_timeout_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_degraded_latency_ms() -> u64 {
    1_000
}

fn default_error_window() -> usize {
    10
}

fn default_error_rate_threshold() -> f64 {
    0.2
}

fn default_email_domain() -> String {
    "campus.test".to_string()
}

fn default_password() -> String {
    "Campus-Test-1!".to_string()
}

fn default_login_path() -> String {
    "/api/auth/login".to_string()
}

fn default_success_location() -> String {
    "/dashboard".to_string()
}

fn default_access_cookie() -> String {
    "access_token".to_string()
}

fn default_refresh_cookie() -> String {
    "refresh_token".to_string()
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_jitter_ms() -> u64 {
    250
}
