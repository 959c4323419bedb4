//! Harness error taxonomy.

use campus_common::{ConfigError, FleetState, RetryableError, ServiceName};
use std::time::Duration;

/// Errors raised by the supervisor, the session helper and the pool.
///
/// Probe failures never appear here; they are reported as
/// [`campus_common::HealthStatus::Unhealthy`] values instead.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The fleet never reached a round where every service was healthy.
    #[error(
        "worker {worker_id} fleet not ready after {rounds} polling rounds ({budget:?}); unhealthy: {}",
        format_services(.unhealthy)
    )]
    StartupTimeout {
        worker_id: u16,
        unhealthy: Vec<ServiceName>,
        rounds: u32,
        budget: Duration,
    },

    /// The supervisory child process exited during startup verification.
    #[error(
        "worker {worker_id} fleet process exited during startup ({status}); unhealthy: {}",
        format_services(.unhealthy)
    )]
    ChildExited {
        worker_id: u16,
        status: String,
        unhealthy: Vec<ServiceName>,
    },

    #[error("failed to spawn fleet process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Network failure or timeout; retried within policy.
    #[error("transient failure for {email} after {attempts} attempt(s): {reason}")]
    Transient {
        email: String,
        attempts: u32,
        reason: String,
    },

    /// Credentials explicitly rejected; never retried.
    #[error("authentication rejected for {email}: {reason}")]
    Authentication { email: String, reason: String },

    /// An operation needed a ready fleet.
    #[error("fleet is not ready (state: {state})")]
    FleetNotReady { state: FleetState },

    #[error("identity {0} is not reserved in the pool")]
    UnknownIdentity(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Services named by a startup failure, if any.
    pub fn unhealthy_services(&self) -> &[ServiceName] {
        match self {
            Self::StartupTimeout { unhealthy, .. } | Self::ChildExited { unhealthy, .. } => {
                unhealthy
            }
            _ => &[],
        }
    }
}

impl RetryableError for HarnessError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

fn format_services(services: &[ServiceName]) -> String {
    if services.is_empty() {
        return "none".to_string();
    }
    services
        .iter()
        .map(ServiceName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_timeout_names_every_service() {
        let err = HarnessError::StartupTimeout {
            worker_id: 2,
            unhealthy: vec![ServiceName::Course, ServiceName::Statistics],
            rounds: 40,
            budget: Duration::from_secs(10),
        };
        let message = err.to_string();
        assert!(message.contains("worker 2"));
        assert!(message.contains("course, statistics"));
        assert_eq!(err.unhealthy_services().len(), 2);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        let transient = HarnessError::Transient {
            email: "a@b".to_string(),
            attempts: 1,
            reason: "timeout".to_string(),
        };
        let auth = HarnessError::Authentication {
            email: "a@b".to_string(),
            reason: "401".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!HarnessError::FleetNotReady {
            state: FleetState::Starting
        }
        .is_retryable());
    }
}
