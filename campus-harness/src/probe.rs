//! Readiness probing for single services.
//!
//! A probe never fails: unreachable ports, timeouts and bad responses all
//! come back as an `unhealthy` [`HealthReport`] so callers can poll in a
//! plain loop.

use campus_common::{HealthEnvelope, HealthReport, HealthStatus, ServiceDescriptor, ServiceKind};
use std::time::{Duration, Instant};
use tracing::trace;

/// Stateless HTTP prober shared by the supervisor and the monitor.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    host: String,
    timeout: Duration,
}

impl HealthProber {
    /// Build a prober for services on `host` with a per-request timeout.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            // A pooled connection can outlive the listener it was opened to.
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
            timeout,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Probe one service.
    pub async fn probe(&self, descriptor: &ServiceDescriptor) -> HealthReport {
        let kind = descriptor.kind();
        let url = format!("{}{}", descriptor.base_url(&self.host), kind.probe_path());
        let start = Instant::now();

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let reason = if e.is_timeout() {
                    format!("timed out after {:?}", self.timeout)
                } else if e.is_connect() {
                    "connection refused".to_string()
                } else {
                    e.to_string()
                };
                trace!(service = %descriptor.name, port = descriptor.port, %reason, "probe failed");
                return HealthReport::new(descriptor, HealthStatus::Unhealthy, latency_ms, reason);
            }
        };

        let status_code = response.status();
        let (status, message) = match kind {
            ServiceKind::Frontend => classify_frontend(status_code),
            ServiceKind::Backend => {
                if status_code != reqwest::StatusCode::OK {
                    (HealthStatus::Unhealthy, format!("HTTP {}", status_code.as_u16()))
                } else {
                    match response.text().await {
                        Ok(body) => classify_backend_body(&body),
                        Err(e) => (
                            HealthStatus::Unhealthy,
                            format!("failed to read health body: {e}"),
                        ),
                    }
                }
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        trace!(service = %descriptor.name, port = descriptor.port, %status, latency_ms, "probe completed");
        HealthReport::new(descriptor, status, latency_ms, message)
    }

    /// Probe every descriptor concurrently; reports come back in input order.
    pub async fn probe_all(&self, descriptors: &[ServiceDescriptor]) -> Vec<HealthReport> {
        futures::future::join_all(descriptors.iter().map(|d| self.probe(d))).await
    }
}

/// Front-end services are ready on any non-5xx answer.
fn classify_frontend(status_code: reqwest::StatusCode) -> (HealthStatus, String) {
    if status_code.is_server_error() {
        (HealthStatus::Unhealthy, format!("HTTP {}", status_code.as_u16()))
    } else {
        (HealthStatus::Healthy, format!("HTTP {}", status_code.as_u16()))
    }
}

/// Interpret a 200 `/health` body.
///
/// A body that is not a health envelope still counts as healthy since the
/// status code already signalled readiness.
fn classify_backend_body(body: &str) -> (HealthStatus, String) {
    match serde_json::from_str::<HealthEnvelope>(body) {
        Ok(envelope) if !envelope.success => (
            HealthStatus::Unhealthy,
            format!("service reported success=false ({})", envelope.data.status),
        ),
        Ok(envelope) => {
            let degraded: Vec<&str> = envelope
                .data
                .checks
                .iter()
                .filter(|check| check.status != HealthStatus::Healthy)
                .map(|check| check.name.as_str())
                .collect();
            let message = if degraded.is_empty() {
                envelope.data.status.to_string()
            } else {
                format!("{} ({})", envelope.data.status, degraded.join(", "))
            };
            (envelope.data.status, message)
        }
        Err(_) => (HealthStatus::Healthy, "HTTP 200".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{StubBehavior, StubService};
    use campus_common::{DependencyCheck, ServiceName};

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn prober() -> HealthProber {
        HealthProber::new("127.0.0.1", Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_classify_backend_body_envelope() {
        let body = serde_json::to_string(&HealthEnvelope::fixed(HealthStatus::Degraded)).unwrap();
        assert_eq!(classify_backend_body(&body).0, HealthStatus::Degraded);
    }

    #[test]
    fn test_classify_backend_body_success_false() {
        let body = r#"{"success": false, "data": {"status": "healthy"}}"#;
        assert_eq!(classify_backend_body(body).0, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_classify_backend_body_names_failing_checks() {
        let envelope = HealthEnvelope::from_checks(vec![DependencyCheck {
            name: "database".to_string(),
            status: HealthStatus::Degraded,
            latency_ms: Some(250),
            message: None,
        }]);
        let body = serde_json::to_string(&envelope).unwrap();
        let (status, message) = classify_backend_body(&body);
        assert_eq!(status, HealthStatus::Degraded);
        assert!(message.contains("database"));
    }

    #[test]
    fn test_classify_backend_body_plain_text() {
        assert_eq!(classify_backend_body("OK").0, HealthStatus::Healthy);
    }

    #[test]
    fn test_classify_frontend() {
        assert_eq!(
            classify_frontend(reqwest::StatusCode::NOT_FOUND).0,
            HealthStatus::Healthy
        );
        assert_eq!(
            classify_frontend(reqwest::StatusCode::BAD_GATEWAY).0,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_probe_unreachable_port_is_unhealthy() {
        let descriptor = ServiceDescriptor {
            name: ServiceName::News,
            port: free_port().await,
        };
        let report = prober().probe(&descriptor).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.service_name, ServiceName::News);
    }

    #[tokio::test]
    async fn test_probe_healthy_backend() {
        let descriptor = ServiceDescriptor {
            name: ServiceName::Course,
            port: free_port().await,
        };
        let stub = StubService::spawn(descriptor, StubBehavior::default())
            .await
            .unwrap();
        let report = prober().probe(&descriptor).await;
        assert_eq!(report.status, HealthStatus::Healthy, "{}", report.message);
        stub.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_backend_reporting_503() {
        let descriptor = ServiceDescriptor {
            name: ServiceName::User,
            port: free_port().await,
        };
        let stub = StubService::spawn(
            descriptor,
            StubBehavior {
                health: HealthStatus::Unhealthy,
                ..StubBehavior::default()
            },
        )
        .await
        .unwrap();
        let report = prober().probe(&descriptor).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.message.contains("503"));
        stub.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_frontend_root() {
        let descriptor = ServiceDescriptor {
            name: ServiceName::Frontend,
            port: free_port().await,
        };
        let stub = StubService::spawn(descriptor, StubBehavior::default())
            .await
            .unwrap();
        let report = prober().probe(&descriptor).await;
        assert!(report.is_healthy(), "{}", report.message);
        stub.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_all_preserves_order() {
        let a = ServiceDescriptor {
            name: ServiceName::Auth,
            port: free_port().await,
        };
        let b = ServiceDescriptor {
            name: ServiceName::Planning,
            port: free_port().await,
        };
        let stub = StubService::spawn(a, StubBehavior::default()).await.unwrap();
        let reports = prober().probe_all(&[a, b]).await;
        assert_eq!(reports[0].service_name, ServiceName::Auth);
        assert!(reports[0].is_healthy());
        assert_eq!(reports[1].service_name, ServiceName::Planning);
        assert!(!reports[1].is_healthy());
        stub.shutdown().await;
    }
}
