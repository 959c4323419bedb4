//! Authenticated session helper.
//!
//! Drives the login endpoint for an identity, retrying transient failures
//! with jittered backoff and surfacing rejected credentials immediately.

use crate::error::{HarnessError, HarnessResult};
use crate::identity::{IdentityRecord, SessionTokens};
use campus_common::retry::run_with_retry;
use campus_common::{LoginConfig, ServiceDescriptor};
use reqwest::header::{HeaderMap, LOCATION, SET_COOKIE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use tracing::{debug, info};

/// Outcome of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Succeeded(SessionTokens),
    TransientFailed(String),
    PermanentFailed(String),
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Succeeded(_) => f.write_str("succeeded"),
            Self::TransientFailed(reason) => write!(f, "transient failure: {reason}"),
            Self::PermanentFailed(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

impl AttemptState {
    fn into_result(self, email: &str, attempt: u32) -> HarnessResult<SessionTokens> {
        match self {
            Self::Succeeded(tokens) => Ok(tokens),
            Self::TransientFailed(reason) => Err(HarnessError::Transient {
                email: email.to_string(),
                attempts: attempt,
                reason,
            }),
            Self::PermanentFailed(reason) => Err(HarnessError::Authentication {
                email: email.to_string(),
                reason,
            }),
            Self::Pending => Err(HarnessError::Transient {
                email: email.to_string(),
                attempts: attempt,
                reason: "attempt did not complete".to_string(),
            }),
        }
    }
}

/// Logs identities in against the fleet's auth service.
#[derive(Debug, Clone)]
pub struct SessionHelper {
    client: reqwest::Client,
    host: String,
    login_url: String,
    config: LoginConfig,
}

impl SessionHelper {
    pub fn new(config: LoginConfig, auth: &ServiceDescriptor, host: &str) -> HarnessResult<Self> {
        // Redirects are the success signal, so they must stay visible.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            host: host.to_string(),
            login_url: format!("{}{}", auth.base_url(host), config.path),
            config,
        })
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Log `record` in and return it with tokens populated.
    pub async fn login(&self, mut record: IdentityRecord) -> HarnessResult<IdentityRecord> {
        let policy = self.config.retry_policy();
        let target = &record;
        let tokens = run_with_retry("login", &policy, move |attempt| async move {
            debug!(email = %target.email, attempt, state = %AttemptState::Pending, "Login attempt");
            let state = self.attempt(target).await;
            debug!(email = %target.email, attempt, %state, "Login attempt finished");
            state.into_result(&target.email, attempt)
        })
        .await?;

        info!(email = %record.email, role = %record.role, "Logged in");
        record.tokens = Some(tokens);
        Ok(record)
    }

    /// One attempt, bounded by the per-attempt timeout.
    pub async fn attempt(&self, record: &IdentityRecord) -> AttemptState {
        let request = self
            .client
            .post(&self.login_url)
            .json(&json!({"email": record.email, "password": record.password}))
            .send();

        let limit = self.config.attempt_timeout();
        let response = match tokio::time::timeout(limit, request).await {
            Err(_) => return AttemptState::TransientFailed(format!("no response within {limit:?}")),
            Ok(Err(e)) => return AttemptState::TransientFailed(describe_send_error(&e)),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = if status.is_success() || status.is_client_error() {
            match tokio::time::timeout(limit, response.text()).await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => return AttemptState::TransientFailed(format!("failed to read body: {e}")),
                Err(_) => return AttemptState::TransientFailed("body read timed out".to_string()),
            }
        } else {
            String::new()
        };

        classify_response(&self.config, status, &headers, &body)
    }

    /// Authenticated client for `service`, using the identity's access token.
    pub fn client_for(
        &self,
        record: &IdentityRecord,
        service: &ServiceDescriptor,
    ) -> HarnessResult<AuthenticatedClient> {
        let tokens = record.tokens.clone().ok_or_else(|| HarnessError::Authentication {
            email: record.email.clone(),
            reason: "identity has no session".to_string(),
        })?;
        Ok(AuthenticatedClient::new(
            self.client.clone(),
            service.base_url(&self.host),
            tokens,
        ))
    }
}

fn describe_send_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        "connection refused".to_string()
    } else {
        e.to_string()
    }
}

/// Map a login response to an attempt outcome.
pub fn classify_response(
    config: &LoginConfig,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> AttemptState {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return AttemptState::TransientFailed(format!("HTTP {}", status.as_u16()));
    }

    if status.is_redirection() {
        let location = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !is_success_location(location, &config.success_location) {
            return AttemptState::PermanentFailed(format!("redirected to '{location}'"));
        }
        return tokens_from(config, headers);
    }

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body)
            && value.get("success").and_then(|s| s.as_bool()) == Some(false)
        {
            return AttemptState::PermanentFailed(error_message(&value, status));
        }
        return tokens_from(config, headers);
    }

    let message = serde_json::from_str::<serde_json::Value>(body)
        .map(|value| error_message(&value, status))
        .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
    AttemptState::PermanentFailed(message)
}

fn error_message(value: &serde_json::Value, status: StatusCode) -> String {
    match value.get("error").and_then(|e| e.as_str()) {
        Some(error) => format!("HTTP {}: {}", status.as_u16(), error),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn is_success_location(location: &str, expected: &str) -> bool {
    let path = location
        .split_once("://")
        .map(|(_, rest)| rest.find('/').map_or("/", |i| &rest[i..]))
        .unwrap_or(location);
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path == expected
}

fn tokens_from(config: &LoginConfig, headers: &HeaderMap) -> AttemptState {
    let mut access = None;
    let mut refresh = None;
    for value in headers.get_all(SET_COOKIE) {
        let Ok(cookie) = value.to_str() else {
            continue;
        };
        let pair = cookie.split(';').next().unwrap_or("");
        let Some((name, token)) = pair.split_once('=') else {
            continue;
        };
        let (name, token) = (name.trim(), token.trim());
        if token.is_empty() {
            continue;
        }
        if name == config.access_cookie {
            access = Some(token.to_string());
        } else if name == config.refresh_cookie {
            refresh = Some(token.to_string());
        }
    }

    match (access, refresh) {
        (Some(access), Some(refresh)) => AttemptState::Succeeded(SessionTokens { access, refresh }),
        (None, _) => AttemptState::PermanentFailed(format!("missing '{}' cookie", config.access_cookie)),
        (_, None) => AttemptState::PermanentFailed(format!("missing '{}' cookie", config.refresh_cookie)),
    }
}

/// HTTP client that acts on behalf of one logged-in identity.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    client: reqwest::Client,
    base_url: String,
    tokens: SessionTokens,
}

impl AuthenticatedClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, tokens: SessionTokens) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request builder with the bearer credential attached.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.tokens.access)
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> RequestBuilder {
        self.request(Method::POST, path).json(body)
    }
}
