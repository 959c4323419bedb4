//! Configuration system for the harness.
//!
//! - `harness.toml` loading with per-field defaults
//! - `CAMPUS_*` environment overrides with error collection
//! - Worker index resolution for parallel test runs

pub mod env;
pub mod harness;

pub use env::{EnvError, EnvParser, WORKER_INDEX_VARS, resolve_worker_index, resolve_worker_index_from};
pub use harness::{
    ConfigError, FleetConfig, HarnessConfig, IdentityConfig, LoginConfig, MonitorConfig,
    SeedAccount, SupervisorConfig,
};
