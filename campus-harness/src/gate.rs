//! Readiness gate: nothing touches the fleet before it is usable.

use crate::error::{HarnessError, HarnessResult};
use campus_common::FleetState;
use std::time::Duration;
use tokio::sync::watch;

/// Read side of a fleet's state channel.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    rx: watch::Receiver<FleetState>,
}

impl ReadinessGate {
    pub fn new(rx: watch::Receiver<FleetState>) -> Self {
        Self { rx }
    }

    /// A gate frozen at `state`, for callers that manage the fleet elsewhere.
    pub fn fixed(state: FleetState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    pub fn state(&self) -> FleetState {
        *self.rx.borrow()
    }

    /// Non-blocking readiness check.
    pub fn is_ready(&self) -> bool {
        self.state().is_usable()
    }

    /// Fail with [`HarnessError::FleetNotReady`] unless the fleet is usable now.
    pub fn ensure_ready(&self) -> HarnessResult<()> {
        let state = self.state();
        if state.is_usable() {
            Ok(())
        } else {
            Err(HarnessError::FleetNotReady { state })
        }
    }

    /// Wait until the fleet is usable; fails once it can no longer become so.
    pub async fn wait_ready(&self) -> HarnessResult<FleetState> {
        let mut rx = self.rx.clone();
        let outcome = rx
            .wait_for(|state| state.is_usable() || state.is_terminal())
            .await
            .map(|state| *state);

        match outcome {
            Ok(state) if state.is_usable() => Ok(state),
            Ok(state) => Err(HarnessError::FleetNotReady { state }),
            // Publisher gone: the last value is final.
            Err(_) => {
                let state = *rx.borrow();
                if state.is_usable() {
                    Ok(state)
                } else {
                    Err(HarnessError::FleetNotReady { state })
                }
            }
        }
    }

    /// [`Self::wait_ready`] bounded by `limit`.
    pub async fn wait_ready_for(&self, limit: Duration) -> HarnessResult<FleetState> {
        match tokio::time::timeout(limit, self.wait_ready()).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::FleetNotReady {
                state: self.state(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_resolves_on_ready() {
        let (tx, rx) = watch::channel(FleetState::Starting);
        let gate = ReadinessGate::new(rx);
        assert!(!gate.is_ready());

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_ready().await }
        });
        tx.send_replace(FleetState::Verifying);
        tx.send_replace(FleetState::Ready);

        assert_eq!(waiter.await.unwrap().unwrap(), FleetState::Ready);
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_fails_on_failed_fleet() {
        let (tx, rx) = watch::channel(FleetState::Verifying);
        let gate = ReadinessGate::new(rx);
        tx.send_replace(FleetState::Failed);
        let err = gate.wait_ready().await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::FleetNotReady {
                state: FleetState::Failed
            }
        ));
    }

    #[tokio::test]
    async fn test_degraded_counts_as_ready() {
        let gate = ReadinessGate::fixed(FleetState::Degraded);
        assert!(gate.ensure_ready().is_ok());
        assert_eq!(gate.wait_ready().await.unwrap(), FleetState::Degraded);
    }

    #[tokio::test]
    async fn test_wait_ready_for_times_out() {
        let (_tx, rx) = watch::channel(FleetState::Starting);
        let gate = ReadinessGate::new(rx);
        let err = gate
            .wait_ready_for(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::FleetNotReady {
                state: FleetState::Starting
            }
        ));
    }

    #[test]
    fn test_ensure_ready_rejects_starting() {
        let gate = ReadinessGate::fixed(FleetState::NotStarted);
        assert!(gate.ensure_ready().is_err());
    }
}
