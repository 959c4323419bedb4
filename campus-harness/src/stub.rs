//! Stand-in service for tests and the `campus-stub` binary.
//!
//! A [`StubService`] binds one descriptor's port and serves the slice of the
//! platform the harness consumes: `/health` on backend services, `/` on the
//! front-end, and the login and session endpoints on the auth service.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use campus_common::service_health::{check_database, check_disk, check_memory};
use campus_common::{
    HealthEnvelope, HealthStatus, IdentityConfig, LoginConfig, ServiceDescriptor, ServiceKind,
    ServiceName,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which credentials the stub auth service accepts.
#[derive(Debug, Clone)]
pub enum StubCredentials {
    /// Any email with this password.
    SharedPassword(String),
    /// Exact email/password pairs.
    Accounts(HashMap<String, String>),
}

impl StubCredentials {
    fn accepts(&self, email: &str, password: &str) -> bool {
        match self {
            Self::SharedPassword(expected) => password == expected,
            Self::Accounts(accounts) => accounts.get(email).is_some_and(|p| p == password),
        }
    }
}

/// Where `/health` takes its status from.
#[derive(Debug, Clone)]
pub enum HealthSource {
    /// Report [`StubBehavior::health`] as is.
    Fixed,
    /// Run live dependency checks and roll them up.
    Checks {
        db_addr: Option<String>,
        disk_dir: PathBuf,
    },
}

/// Behaviour knobs for one stub service.
#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub health: HealthStatus,
    pub health_source: HealthSource,
    pub credentials: StubCredentials,
    /// The first N login requests are answered with 503.
    pub transient_login_failures: u32,
    /// Artificial delay before answering a login request.
    pub login_delay: Option<Duration>,
    pub login: LoginConfig,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            health: HealthStatus::Healthy,
            health_source: HealthSource::Fixed,
            credentials: StubCredentials::SharedPassword(
                IdentityConfig::default().default_password,
            ),
            transient_login_failures: 0,
            login_delay: None,
            login: LoginConfig::default(),
        }
    }
}

struct StubState {
    descriptor: ServiceDescriptor,
    behavior: StubBehavior,
    login_requests: AtomicU32,
    remaining_failures: AtomicU32,
    sessions: Mutex<HashMap<String, String>>,
}

/// Handle to a running stub; [`StubHandle::shutdown`] closes the port.
pub struct StubHandle {
    descriptor: ServiceDescriptor,
    state: Arc<StubState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StubHandle {
    pub fn descriptor(&self) -> ServiceDescriptor {
        self.descriptor
    }

    /// Number of login requests received so far.
    pub fn login_requests(&self) -> u32 {
        self.state.login_requests.load(Ordering::SeqCst)
    }

    /// Stop serving and release the port.
    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
        {
            warn!(service = %self.descriptor, "stub did not drain in time, aborting");
            task.abort();
        }
        debug!(service = %self.descriptor, "stub stopped");
    }
}

impl Drop for StubHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Stub service entry point.
pub struct StubService;

impl StubService {
    /// Bind `127.0.0.1:<port>` and serve until the handle is shut down.
    pub async fn spawn(
        descriptor: ServiceDescriptor,
        behavior: StubBehavior,
    ) -> std::io::Result<StubHandle> {
        Self::spawn_on("127.0.0.1", descriptor, behavior).await
    }

    /// Bind `<host>:<port>` and serve until the handle is shut down.
    pub async fn spawn_on(
        host: &str,
        descriptor: ServiceDescriptor,
        behavior: StubBehavior,
    ) -> std::io::Result<StubHandle> {
        let listener = TcpListener::bind((host, descriptor.port)).await?;
        let state = Arc::new(StubState {
            descriptor,
            remaining_failures: AtomicU32::new(behavior.transient_login_failures),
            behavior,
            login_requests: AtomicU32::new(0),
            sessions: Mutex::new(HashMap::new()),
        });
        let router = build_router(state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(service = %descriptor, "stub server error: {}", e);
            }
        });

        info!(service = %descriptor.name, port = descriptor.port, "stub listening");
        Ok(StubHandle {
            descriptor,
            state,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

fn build_router(state: Arc<StubState>) -> Router {
    let descriptor = state.descriptor;
    let mut router = Router::new();

    router = match descriptor.kind() {
        ServiceKind::Frontend => router.route("/", get(frontend_handler)),
        ServiceKind::Backend => router.route("/health", get(health_handler)),
    };

    if descriptor.name == ServiceName::Auth {
        let login_path = state.behavior.login.path.clone();
        router = router
            .route(&login_path, post(login_handler))
            .route("/api/auth/me", get(me_handler));
    }

    router.with_state(state)
}

async fn frontend_handler() -> Html<&'static str> {
    Html("<!doctype html><html><body><div id=\"app\"></div></body></html>")
}

async fn health_handler(State(state): State<Arc<StubState>>) -> impl IntoResponse {
    let envelope = match &state.behavior.health_source {
        HealthSource::Fixed => HealthEnvelope::fixed(state.behavior.health),
        HealthSource::Checks { db_addr, disk_dir } => {
            let mut checks = Vec::with_capacity(3);
            if let Some(addr) = db_addr {
                checks.push(check_database(addr, Duration::from_secs(2)).await);
            }
            checks.push(check_memory());
            let dir = disk_dir.clone();
            match tokio::task::spawn_blocking(move || check_disk(&dir)).await {
                Ok(check) => checks.push(check),
                Err(e) => warn!("disk check task failed: {}", e),
            }
            HealthEnvelope::from_checks(checks)
        }
    };

    let code = if envelope.data.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(envelope))
}

async fn login_handler(
    State(state): State<Arc<StubState>>,
    Json(request): Json<LoginRequest>,
) -> Response {
    state.login_requests.fetch_add(1, Ordering::SeqCst);

    let should_fail = state
        .remaining_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if should_fail {
        debug!(email = %request.email, "stub login answering 503");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": "Service temporarily unavailable"})),
        )
            .into_response();
    }

    if let Some(delay) = state.behavior.login_delay {
        tokio::time::sleep(delay).await;
    }

    if !state
        .behavior
        .credentials
        .accepts(&request.email, &request.password)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "Invalid credentials"})),
        )
            .into_response();
    }

    let access = uuid::Uuid::new_v4().simple().to_string();
    let refresh = uuid::Uuid::new_v4().simple().to_string();
    state
        .sessions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(access.clone(), request.email.clone());

    let login = &state.behavior.login;
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(header::LOCATION, login.success_location.as_str())
        .header(
            header::SET_COOKIE,
            format!("{}={}; Path=/; HttpOnly", login.access_cookie, access),
        )
        .header(
            header::SET_COOKIE,
            format!("{}={}; Path=/; HttpOnly", login.refresh_cookie, refresh),
        )
        .body(Body::empty())
        .unwrap_or_else(|e| {
            warn!("failed to build login response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn me_handler(State(state): State<Arc<StubState>>, headers: HeaderMap) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let email = token.and_then(|token| {
        state
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(token)
            .cloned()
    });

    match email {
        Some(email) => Json(json!({"success": true, "data": {"email": email}})).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "Not authenticated"})),
        )
            .into_response(),
    }
}
