//! Test logging for CI debugging.
//!
//! Call `init_test_logging()` at the start of a test (or from a shared
//! `tests/common` module); it is safe to call any number of times.
//!
//! ```ignore
//! use campus_common::testing::init_test_logging;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     init_test_logging();
//!     tracing::info!(phase = %TestPhase::Setup, "starting stubs");
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    /// Test initialization.
    Setup,
    /// Main test execution.
    Execute,
    /// Result verification.
    Verify,
    /// Resource cleanup.
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per process.
///
/// The level comes from `CAMPUS_TEST_LOG_LEVEL` (default `debug` for the
/// harness crates, `warn` for everything else); `RUST_LOG` wins when set.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("CAMPUS_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(format!(
                "warn,campus_common={level},campus_harness={level},campus_stub={level},test={level}"
            ))
            .unwrap_or_else(|_| EnvFilter::new("info"))
        });

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .compact(),
            )
            .with(filter)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(TestPhase::Setup.to_string(), "setup");
        assert_eq!(TestPhase::Teardown.to_string(), "teardown");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("logging initialized twice without panicking");
    }
}
