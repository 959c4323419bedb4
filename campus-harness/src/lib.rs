//! Campus test harness
//!
//! Supervises one service fleet per test worker, gates tests on fleet
//! readiness, keeps a background health view of the fleet, and hands out
//! isolated, logged-in test identities.

#![forbid(unsafe_code)]

pub mod context;
pub mod error;
pub mod gate;
pub mod identity;
pub mod monitor;
pub mod probe;
pub mod run;
pub mod session;
pub mod stub;
pub mod supervisor;

pub use context::TestSession;
pub use error::{HarnessError, HarnessResult};
pub use gate::ReadinessGate;
pub use identity::{IdentityId, IdentityPool, IdentityRecord, IdentityState, RoleStats, SessionTokens};
pub use monitor::{FleetHealthMonitor, FleetHealthSnapshot, ServiceHealth, aggregate};
pub use probe::HealthProber;
pub use run::{FleetRun, RunContext};
pub use session::{AttemptState, AuthenticatedClient, SessionHelper};
pub use stub::{HealthSource, StubBehavior, StubCredentials, StubHandle, StubService};
pub use supervisor::{FleetSupervisor, OwnedProcess, is_process_alive};
