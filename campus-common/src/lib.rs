//! Campus test harness - Common Library
//!
//! Shared types, the service descriptor table, configuration, logging and
//! retry utilities used by `campus-harness` and `campus-stub`.

// Use deny instead of forbid so tests can override env vars
// (env::set_var/remove_var are unsafe in Rust 2024)
#![deny(unsafe_code)]

pub mod config;
pub mod descriptors;
pub mod logging;
pub mod retry;
pub mod service_health;
pub mod testing;
pub mod types;

pub use config::{
    ConfigError, EnvError, EnvParser, FleetConfig, HarnessConfig, IdentityConfig, LoginConfig,
    MonitorConfig, SeedAccount, SupervisorConfig, resolve_worker_index,
};
pub use descriptors::{
    BASE_PORT, MAX_WORKER_ID, PORT_STRIDE, SERVICE_ORDER, base_port, checked_base_port, descriptor_of,
    descriptors_for, port_for,
};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use retry::{RetryPolicy, RetryableError};
pub use service_health::{DependencyCheck, HealthEnvelope, HealthPayload, rollup};
pub use types::{FleetState, HealthReport, HealthStatus, Role, ServiceDescriptor, ServiceKind, ServiceName};
