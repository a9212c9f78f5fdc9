use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ::time::{format_description::well_known, OffsetDateTime};

/// A persisted recurring probe definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub target: String,
    pub start_port: u16,
    pub end_port: u16,
    pub interval_seconds: u64,
    pub active: bool,
    pub created_at: String,
}

impl Job {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Number of ports one sweep of this job probes.
    pub fn width(&self) -> usize {
        usize::from(self.end_port).saturating_sub(usize::from(self.start_port)) + 1
    }
}

/// Fields supplied when creating a job; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub target: String,
    pub start_port: u16,
    pub end_port: u16,
    pub interval_seconds: u64,
    pub active: bool,
}

/// Outcome of one port probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub is_open: bool,
    pub duration_ms: u64,
}

/// A probe outcome as persisted by the store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub id: i64,
    pub target: String,
    pub port: u16,
    pub is_open: bool,
    pub duration_ms: u64,
    pub created_at: String,
}

/// Filter for scan history lookups.
#[derive(Deserialize, Debug, Clone)]
pub struct ScanQuery {
    /// Substring match on the target.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub open_only: bool,
    #[serde(default = "default_scan_limit")]
    pub limit: u32,
}

impl Default for ScanQuery {
    fn default() -> Self {
        Self {
            target: None,
            open_only: false,
            limit: default_scan_limit(),
        }
    }
}

fn default_scan_limit() -> u32 {
    50
}

/// Aggregate counters over the whole scan history.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    pub total_scans: u64,
    pub open_ports: u64,
    pub avg_scan_time_ms: f64,
}

/// Published once per completed sweep. `job_id` is `None` for one-shot scans.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SweepEvent {
    pub job_id: Option<i64>,
    pub target: String,
    pub results: Vec<PortResult>,
    pub finished_at: String,
}

/// One pass of the retention cleanup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CleanupRun {
    pub id: i64,
    pub deleted_count: u64,
    pub run_time_ms: u64,
    pub ran_at: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// RFC3339 UTC rendering of an epoch-millisecond timestamp.
pub fn millis_to_rfc3339(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&well_known::Rfc3339).ok())
        .unwrap_or_else(|| String::from("1970-01-01T00:00:00Z"))
}

pub fn now_rfc3339() -> String {
    millis_to_rfc3339(now_millis())
}
