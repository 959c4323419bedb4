//! Test helpers shared by the harness crates.

mod log;

pub use log::{TestPhase, init_test_logging};
