//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `CAMPUS_` environment variables that
//! collects every error so all issues can be reported at once, plus worker
//! index resolution for parallel test runs.

use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Variables consulted for the worker index, in priority order.
pub const WORKER_INDEX_VARS: [&str; 3] =
    ["CAMPUS_WORKER_ID", "TEST_WORKER_INDEX", "TEST_PARALLEL_INDEX"];

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the CAMPUS_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "CAMPUS_",
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value if the variable is set and non-empty.
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        env::var(self.var_name(name))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> bool {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "boolean (true/false/1/0/yes/no)".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> u32 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<u32>() {
                Ok(n) if n >= min && n <= max => n,
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name,
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    default
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name,
                        expected: "unsigned 32-bit integer".to_string(),
                        value,
                    });
                    default
                }
            },
            Err(_) => default,
        }
    }

    /// Get a duration in milliseconds.
    ///
    /// Accepts a bare integer (milliseconds) or a humantime string such as
    /// `250ms` or `1m 30s`.
    pub fn get_duration_ms(&mut self, name: &str, default: u64) -> u64 {
        let var_name = self.var_name(name);
        let Ok(value) = env::var(&var_name) else {
            return default;
        };
        let trimmed = value.trim();
        if let Ok(ms) = trimmed.parse::<u64>() {
            return ms;
        }
        match humantime::parse_duration(trimmed) {
            Ok(duration) => duration.as_millis() as u64,
            Err(_) => {
                self.errors
                    .push(EnvError::InvalidDuration { var: var_name, value });
                default
            }
        }
    }

    /// Get a duration value.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Duration {
        Duration::from_millis(self.get_duration_ms(name, default.as_millis() as u64))
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the worker index from the environment, defaulting to `0`.
///
/// The first variable in [`WORKER_INDEX_VARS`] holding a non-negative
/// integer wins; unparseable values are skipped with a warning.
pub fn resolve_worker_index() -> u16 {
    resolve_worker_index_from(|name| env::var(name).ok())
}

/// Same as [`resolve_worker_index`] with an injectable lookup.
pub fn resolve_worker_index_from<F>(lookup: F) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    for name in WORKER_INDEX_VARS {
        let Some(raw) = lookup(name) else {
            continue;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<u16>() {
            Ok(index) if index <= crate::descriptors::MAX_WORKER_ID => return index,
            _ => warn!(var = name, value = %raw, "Ignoring invalid worker index"),
        }
    }
    0
}
