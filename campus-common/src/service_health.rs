//! Per-service health envelope and dependency checks.
//!
//! Each backend service answers `GET /health` with a [`HealthEnvelope`]. The
//! status inside is the worst of its dependency checks: database
//! reachability and latency, memory headroom, and disk I/O latency.

use crate::types::HealthStatus;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Database latency above which the check is degraded.
pub const DB_DEGRADED_MS: u64 = 100;
/// Database latency above which the check is unhealthy.
pub const DB_UNHEALTHY_MS: u64 = 1000;
/// Available memory ratio below which the check is degraded.
pub const MEMORY_DEGRADED_RATIO: f64 = 0.15;
/// Available memory ratio below which the check is unhealthy.
pub const MEMORY_UNHEALTHY_RATIO: f64 = 0.05;
/// Write+fsync latency above which the check is degraded.
pub const DISK_DEGRADED_MS: u64 = 100;
/// Write+fsync latency above which the check is unhealthy.
pub const DISK_UNHEALTHY_MS: u64 = 1000;

/// JSON body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEnvelope {
    pub success: bool,
    pub data: HealthPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<DependencyCheck>,
}

impl HealthEnvelope {
    /// Envelope for a fixed status with no dependency detail.
    pub fn fixed(status: HealthStatus) -> Self {
        Self {
            success: status != HealthStatus::Unhealthy,
            data: HealthPayload {
                status,
                checks: Vec::new(),
            },
        }
    }

    /// Envelope rolled up from dependency checks.
    pub fn from_checks(checks: Vec<DependencyCheck>) -> Self {
        let status = rollup(&checks);
        Self {
            success: status != HealthStatus::Unhealthy,
            data: HealthPayload { status, checks },
        }
    }
}

/// Outcome of one dependency check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DependencyCheck {
    fn new(name: &str, status: HealthStatus, latency_ms: Option<u64>, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            latency_ms,
            message,
        }
    }
}

/// Worst-of rule over a set of checks; an empty set is healthy.
pub fn rollup(checks: &[DependencyCheck]) -> HealthStatus {
    checks
        .iter()
        .map(|check| check.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

/// Classify a latency against degraded/unhealthy thresholds.
pub fn classify_latency(latency_ms: u64, degraded_ms: u64, unhealthy_ms: u64) -> HealthStatus {
    if latency_ms > unhealthy_ms {
        HealthStatus::Unhealthy
    } else if latency_ms > degraded_ms {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Classify the available-memory ratio.
pub fn classify_memory_headroom(available_kb: u64, total_kb: u64) -> HealthStatus {
    if total_kb == 0 {
        return HealthStatus::Degraded;
    }
    let ratio = available_kb as f64 / total_kb as f64;
    if ratio < MEMORY_UNHEALTHY_RATIO {
        HealthStatus::Unhealthy
    } else if ratio < MEMORY_DEGRADED_RATIO {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Database reachability: TCP connect under `timeout`.
pub async fn check_database(addr: &str, timeout: Duration) -> DependencyCheck {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let status = classify_latency(latency_ms, DB_DEGRADED_MS, DB_UNHEALTHY_MS);
            DependencyCheck::new("database", status, Some(latency_ms), None)
        }
        Ok(Err(e)) => DependencyCheck::new(
            "database",
            HealthStatus::Unhealthy,
            None,
            Some(format!("connect to {addr} failed: {e}")),
        ),
        Err(_) => DependencyCheck::new(
            "database",
            HealthStatus::Unhealthy,
            None,
            Some(format!("connect to {addr} timed out after {timeout:?}")),
        ),
    }
}

/// Parse `MemTotal` and `MemAvailable` (kB) out of `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free_estimate = 0u64;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(kb) = value.trim().trim_end_matches(" kB").trim().parse::<u64>() else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(kb),
            "MemAvailable" => available = Some(kb),
            // MemAvailable is missing on very old kernels
            "MemFree" | "Buffers" | "Cached" => free_estimate += kb,
            _ => {}
        }
    }

    Some((total?, available.unwrap_or(free_estimate)))
}

/// Memory headroom from `/proc/meminfo`.
pub fn check_memory() -> DependencyCheck {
    let content = match std::fs::read_to_string("/proc/meminfo") {
        Ok(content) => content,
        Err(e) => {
            return DependencyCheck::new(
                "memory",
                HealthStatus::Degraded,
                None,
                Some(format!("meminfo unavailable: {e}")),
            );
        }
    };
    match parse_meminfo(&content) {
        Some((total_kb, available_kb)) => {
            let status = classify_memory_headroom(available_kb, total_kb);
            let message = format!("{available_kb} kB of {total_kb} kB available");
            DependencyCheck::new("memory", status, None, Some(message))
        }
        None => DependencyCheck::new(
            "memory",
            HealthStatus::Degraded,
            None,
            Some("meminfo missing MemTotal".to_string()),
        ),
    }
}

/// Disk I/O latency: write and fsync a small temp file inside `dir`.
pub fn check_disk(dir: &Path) -> DependencyCheck {
    let start = Instant::now();
    let result = tempfile::NamedTempFile::new_in(dir).and_then(|mut file| {
        file.write_all(&[0u8; 4096])?;
        file.as_file().sync_all()
    });
    match result {
        Ok(()) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            debug!(latency_ms, "disk check completed");
            let status = classify_latency(latency_ms, DISK_DEGRADED_MS, DISK_UNHEALTHY_MS);
            DependencyCheck::new("disk", status, Some(latency_ms), None)
        }
        Err(e) => DependencyCheck::new(
            "disk",
            HealthStatus::Unhealthy,
            None,
            Some(format!("write to {} failed: {e}", dir.display())),
        ),
    }
}
