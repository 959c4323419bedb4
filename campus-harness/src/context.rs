//! Per-test session bookkeeping.
//!
//! A [`TestSession`] is the only owner of the identities a test acquires.
//! Dropping it returns them to the pool, so an early return or a panicking
//! assertion cannot leak a reservation.

use crate::error::{HarnessError, HarnessResult};
use crate::identity::{IdentityRecord, IdentityState};
use crate::run::RunContext;
use crate::session::AuthenticatedClient;
use campus_common::{Role, ServiceName};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TestSession {
    test_id: String,
    run: Arc<RunContext>,
    acquired: Vec<IdentityRecord>,
}

impl TestSession {
    pub fn begin(run: Arc<RunContext>, test_id: impl Into<String>) -> Self {
        let test_id = test_id.into();
        debug!(test_id = %test_id, "Test session opened");
        Self {
            test_id,
            run,
            acquired: Vec::new(),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Identities currently held, as last seen by this session.
    pub fn identities(&self) -> &[IdentityRecord] {
        &self.acquired
    }

    /// Reserve an identity of `role`. Requires a usable fleet.
    pub fn acquire(&mut self, role: Role) -> HarnessResult<IdentityRecord> {
        self.run.gate.ensure_ready()?;
        let record = self.run.pool.acquire(role, &self.test_id);
        self.acquired.push(record.clone());
        Ok(record)
    }

    /// Wait for a usable fleet, reserve an identity of `role` and log it in.
    ///
    /// A failed login keeps the identity registered; it is released with the session.
    pub async fn login(&mut self, role: Role) -> HarnessResult<IdentityRecord> {
        self.run.gate.wait_ready().await?;
        let record = self.acquire(role)?;
        let logged_in = self.run.sessions.login(record).await?;
        let tokens = logged_in.tokens.clone().ok_or_else(|| HarnessError::Authentication {
            email: logged_in.email.clone(),
            reason: "login returned no session".to_string(),
        })?;
        let stored = self.run.pool.attach_tokens(&logged_in, tokens)?;
        if let Some(held) = self.acquired.iter_mut().find(|r| r.id == stored.id) {
            *held = stored.clone();
        }
        Ok(stored)
    }

    /// Client acting as `record` against `service`.
    pub fn client(&self, record: &IdentityRecord, service: ServiceName) -> HarnessResult<AuthenticatedClient> {
        self.run.sessions.client_for(record, &self.run.descriptor(service))
    }

    /// Release every identity still held. Returns how many reservations were cleared.
    pub fn end(mut self) -> usize {
        self.release_all()
    }

    fn release_all(&mut self) -> usize {
        let mut released = 0;
        for record in &mut self.acquired {
            if record.state == IdentityState::Released {
                continue;
            }
            if self.run.pool.release(record) {
                released += 1;
            }
            record.state = IdentityState::Released;
            record.tokens = None;
            record.reserved_by = None;
        }
        if released > 0 {
            info!(test_id = %self.test_id, released, "Test session released identities");
        }
        released
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ReadinessGate;
    use crate::identity::IdentityPool;
    use crate::session::SessionHelper;
    use campus_common::{FleetState, IdentityConfig, LoginConfig, descriptors_for};

    fn run_context(state: FleetState) -> Arc<RunContext> {
        let descriptors = descriptors_for(0);
        let auth = descriptors[1];
        Arc::new(RunContext::new(
            0,
            descriptors,
            IdentityPool::from_config(&IdentityConfig::default()),
            ReadinessGate::fixed(state),
            SessionHelper::new(LoginConfig::default(), &auth, "127.0.0.1").unwrap(),
        ))
    }

    #[test]
    fn test_acquire_blocked_until_ready() {
        let run = run_context(FleetState::Verifying);
        let mut session = TestSession::begin(run.clone(), "early");
        let err = session.acquire(Role::Admin).unwrap_err();
        assert!(matches!(err, HarnessError::FleetNotReady { .. }));
        assert!(session.identities().is_empty());
    }

    #[tokio::test]
    async fn test_login_fails_once_fleet_cannot_become_ready() {
        let run = run_context(FleetState::Failed);
        let mut session = TestSession::begin(run.clone(), "failed-fleet");
        let err = session.login(Role::Student).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::FleetNotReady {
                state: FleetState::Failed
            }
        ));
        assert!(session.identities().is_empty());
    }

    #[test]
    fn test_end_releases_everything() {
        let run = run_context(FleetState::Ready);
        let mut session = TestSession::begin(run.clone(), "t-end");
        session.acquire(Role::Admin).unwrap();
        session.acquire(Role::Student).unwrap();
        assert_eq!(run.pool.reserved_by("t-end").len(), 2);

        assert_eq!(session.end(), 2);
        assert!(run.pool.reserved_by("t-end").is_empty());
    }

    #[test]
    fn test_panic_in_test_body_still_releases() {
        let run = run_context(FleetState::Ready);
        let inner = run.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut session = TestSession::begin(inner, "t-panic");
            session.acquire(Role::Teacher).unwrap();
            panic!("assertion failed inside test body");
        }));
        assert!(outcome.is_err());
        assert!(run.pool.reserved_by("t-panic").is_empty());
        assert_eq!(run.pool.stats()[&Role::Teacher].reserved, 0);
    }

    #[test]
    fn test_session_end_leaves_a_reused_identity_alone() {
        let run = run_context(FleetState::Ready);
        let mut early = TestSession::begin(run.clone(), "early-release");
        let record = early.acquire(Role::Teacher).unwrap();
        assert!(run.pool.release(&record));

        let mut other = TestSession::begin(run.clone(), "holder");
        let held = other.acquire(Role::Teacher).unwrap();
        assert_eq!(held.id, record.id);

        assert_eq!(early.end(), 0);
        assert_eq!(run.pool.reserved_by("holder").len(), 1);
        let next = TestSession::begin(run.clone(), "next").acquire(Role::Teacher).unwrap();
        assert_ne!(next.id, held.id);
    }

    #[test]
    fn test_released_identity_is_reused_by_next_test() {
        let run = run_context(FleetState::Ready);
        let first = {
            let mut session = TestSession::begin(run.clone(), "first");
            session.acquire(Role::Staff).unwrap()
        };
        let mut second = TestSession::begin(run.clone(), "second");
        let again = second.acquire(Role::Staff).unwrap();
        assert_eq!(first.email, again.email);
        assert!(again.tokens.is_none());
    }
}
