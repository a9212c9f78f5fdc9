//! Persistence for job definitions and per-port scan outcomes.
//!
//! The scheduler only depends on the [`JobStore`] trait; `SqliteStore` is the
//! durable backend and `InMemoryStore` backs tests and throwaway runs.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{CleanupRun, Job, NewJob, PortResult, ScanQuery, ScanRecord, ScanStats};

/// Errors reported by a job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A batch transaction could not be opened or committed.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// A stored row could not be mapped back into a model type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Operations the scheduler and API need from durable storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job operations

    /// Persist a new job and return it with its assigned id and creation time.
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// All jobs flagged active.
    async fn select_active_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn select_job_by_id(&self, id: i64) -> Result<Job, StoreError>;

    /// Flip the persisted active flag. Fails with `NotFound` for an unknown id.
    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError>;

    async fn delete_job(&self, id: i64) -> Result<(), StoreError>;

    /// All jobs, newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    // Scan operations

    /// Write one probe outcome on its own.
    async fn insert_scan_result(&self, target: &str, result: &PortResult)
        -> Result<(), StoreError>;

    /// Write a whole sweep atomically: either every row lands or none does.
    async fn insert_scan_batch(&self, target: &str, results: &[PortResult])
        -> Result<(), StoreError>;

    /// Scan history, newest first, filtered by `query`.
    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<ScanRecord>, StoreError>;

    async fn scan_stats(&self) -> Result<ScanStats, StoreError>;

    async fn delete_scan(&self, id: i64) -> Result<(), StoreError>;

    /// Remove every scan row for `target`, returning how many were deleted.
    async fn delete_scans_for_target(&self, target: &str) -> Result<u64, StoreError>;

    /// Remove closed-port rows recorded before `cutoff_ms` (epoch millis).
    async fn delete_closed_scans_before(&self, cutoff_ms: i64) -> Result<u64, StoreError>;

    // Cleanup bookkeeping

    async fn insert_cleanup_log(&self, deleted_count: u64, run_time_ms: u64)
        -> Result<(), StoreError>;

    /// Most recent cleanup runs first.
    async fn list_cleanup_logs(&self, limit: u32) -> Result<Vec<CleanupRun>, StoreError>;
}
