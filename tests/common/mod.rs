//! Shared fakes for the scheduler and API tests.
#![allow(dead_code)]

use async_trait::async_trait;
use portwatch_rs::notify::FailureNotifier;
use portwatch_rs::scanner::PortProber;
use portwatch_rs::store::{InMemoryStore, JobStore, StoreError};
use portwatch_rs::types::{
    CleanupRun, Job, NewJob, PortResult, ScanQuery, ScanRecord, ScanStats,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Prober that answers after a fixed delay and records overlap.
///
/// Even ports report open.
#[derive(Debug, Default)]
pub struct ScriptedProber {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortProber for ScriptedProber {
    async fn probe_range(&self, _target: &str, start_port: u16, end_port: u16) -> Vec<PortResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (start_port..=end_port)
            .map(|port| PortResult {
                port,
                is_open: port % 2 == 0,
                duration_ms: 1,
            })
            .collect()
    }
}

/// In-memory store that counts mutations and can be told to fail writes.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: InMemoryStore,
    pub fail_batches: AtomicBool,
    /// Per-row writes for this port fail.
    pub poisoned_port: Mutex<Option<u16>>,
    pub set_active_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_batches(poisoned_port: Option<u16>) -> Arc<Self> {
        let store = Self::default();
        store.fail_batches.store(true, Ordering::SeqCst);
        *store.poisoned_port.lock().unwrap() = poisoned_port;
        Arc::new(store)
    }

    pub fn set_active_calls(&self) -> usize {
        self.set_active_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.inner.insert_job(job).await
    }

    async fn select_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.select_active_jobs().await
    }

    async fn select_job_by_id(&self, id: i64) -> Result<Job, StoreError> {
        self.inner.select_job_by_id(id).await
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        self.set_active_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_active(id, active).await
    }

    async fn delete_job(&self, id: i64) -> Result<(), StoreError> {
        self.inner.delete_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs().await
    }

    async fn insert_scan_result(
        &self,
        target: &str,
        result: &PortResult,
    ) -> Result<(), StoreError> {
        if *self.poisoned_port.lock().unwrap() == Some(result.port) {
            return Err(StoreError::Database(format!("port {} rejected", result.port)));
        }
        self.inner.insert_scan_result(target, result).await
    }

    async fn insert_scan_batch(
        &self,
        target: &str,
        results: &[PortResult],
    ) -> Result<(), StoreError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("begin: database is locked".into()));
        }
        self.inner.insert_scan_batch(target, results).await
    }

    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<ScanRecord>, StoreError> {
        self.inner.list_scans(query).await
    }

    async fn scan_stats(&self) -> Result<ScanStats, StoreError> {
        self.inner.scan_stats().await
    }

    async fn delete_scan(&self, id: i64) -> Result<(), StoreError> {
        self.inner.delete_scan(id).await
    }

    async fn delete_scans_for_target(&self, target: &str) -> Result<u64, StoreError> {
        self.inner.delete_scans_for_target(target).await
    }

    async fn delete_closed_scans_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.inner.delete_closed_scans_before(cutoff_ms).await
    }

    async fn insert_cleanup_log(
        &self,
        deleted_count: u64,
        run_time_ms: u64,
    ) -> Result<(), StoreError> {
        self.inner.insert_cleanup_log(deleted_count, run_time_ms).await
    }

    async fn list_cleanup_logs(&self, limit: u32) -> Result<Vec<CleanupRun>, StoreError> {
        self.inner.list_cleanup_logs(limit).await
    }
}

/// Notifier that remembers which targets it was told about.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub failures: Mutex<Vec<String>>,
}

impl FailureNotifier for RecordingNotifier {
    fn notify_failure(&self, target: &str, _error: &StoreError) {
        self.failures.lock().unwrap().push(target.to_string());
    }
}

/// Let spawned tasks run without moving the paused clock meaningfully.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
