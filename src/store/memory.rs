//! In-memory store for tests and ephemeral runs. Nothing survives a restart.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{JobStore, StoreError};
use crate::types::{
    millis_to_rfc3339, now_millis, CleanupRun, Job, NewJob, PortResult, ScanQuery, ScanRecord,
    ScanStats,
};

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<i64, Job>,
    // (created_at_ms, record)
    scans: Vec<(i64, ScanRecord)>,
    cleanup_runs: Vec<CleanupRun>,
    next_job_id: i64,
    next_scan_id: i64,
}

impl State {
    fn push_scan(&mut self, target: &str, r: &PortResult) {
        self.next_scan_id += 1;
        let ms = now_millis();
        self.scans.push((
            ms,
            ScanRecord {
                id: self.next_scan_id,
                target: target.to_string(),
                port: r.port,
                is_open: r.is_open,
                duration_ms: r.duration_ms,
                created_at: millis_to_rfc3339(ms),
            },
        ));
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted scan rows.
    pub async fn scan_count(&self) -> usize {
        self.state.read().await.scans.len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut s = self.state.write().await;
        s.next_job_id += 1;
        let row = Job {
            id: s.next_job_id,
            target: job.target,
            start_port: job.start_port,
            end_port: job.end_port,
            interval_seconds: job.interval_seconds,
            active: job.active,
            created_at: millis_to_rfc3339(now_millis()),
        };
        s.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn select_active_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let s = self.state.read().await;
        Ok(s.jobs.values().filter(|j| j.active).cloned().collect())
    }

    async fn select_job_by_id(&self, id: i64) -> Result<Job, StoreError> {
        let s = self.state.read().await;
        s.jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let mut s = self.state.write().await;
        let job = s
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.active = active;
        Ok(())
    }

    async fn delete_job(&self, id: i64) -> Result<(), StoreError> {
        let mut s = self.state.write().await;
        s.jobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let s = self.state.read().await;
        // ids are handed out in creation order
        Ok(s.jobs.values().rev().cloned().collect())
    }

    async fn insert_scan_result(
        &self,
        target: &str,
        result: &PortResult,
    ) -> Result<(), StoreError> {
        self.state.write().await.push_scan(target, result);
        Ok(())
    }

    async fn insert_scan_batch(
        &self,
        target: &str,
        results: &[PortResult],
    ) -> Result<(), StoreError> {
        let mut s = self.state.write().await;
        for r in results {
            s.push_scan(target, r);
        }
        Ok(())
    }

    async fn list_scans(&self, query: &ScanQuery) -> Result<Vec<ScanRecord>, StoreError> {
        let s = self.state.read().await;
        Ok(s.scans
            .iter()
            .rev()
            .map(|(_, rec)| rec)
            .filter(|rec| {
                query
                    .target
                    .as_deref()
                    .map_or(true, |t| rec.target.contains(t))
            })
            .filter(|rec| !query.open_only || rec.is_open)
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn scan_stats(&self) -> Result<ScanStats, StoreError> {
        let s = self.state.read().await;
        let total = s.scans.len() as u64;
        let open = s.scans.iter().filter(|(_, r)| r.is_open).count() as u64;
        let avg = if total == 0 {
            0.0
        } else {
            s.scans.iter().map(|(_, r)| r.duration_ms as f64).sum::<f64>() / total as f64
        };
        Ok(ScanStats {
            total_scans: total,
            open_ports: open,
            avg_scan_time_ms: avg,
        })
    }

    async fn delete_scan(&self, id: i64) -> Result<(), StoreError> {
        let mut s = self.state.write().await;
        let before = s.scans.len();
        s.scans.retain(|(_, r)| r.id != id);
        if s.scans.len() == before {
            return Err(StoreError::NotFound(format!("scan {id}")));
        }
        Ok(())
    }

    async fn delete_scans_for_target(&self, target: &str) -> Result<u64, StoreError> {
        let mut s = self.state.write().await;
        let before = s.scans.len();
        s.scans.retain(|(_, r)| r.target != target);
        Ok((before - s.scans.len()) as u64)
    }

    async fn delete_closed_scans_before(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut s = self.state.write().await;
        let before = s.scans.len();
        s.scans.retain(|(ms, r)| r.is_open || *ms >= cutoff_ms);
        Ok((before - s.scans.len()) as u64)
    }

    async fn insert_cleanup_log(
        &self,
        deleted_count: u64,
        run_time_ms: u64,
    ) -> Result<(), StoreError> {
        let mut s = self.state.write().await;
        let id = s.cleanup_runs.len() as i64 + 1;
        s.cleanup_runs.push(CleanupRun {
            id,
            deleted_count,
            run_time_ms,
            ran_at: millis_to_rfc3339(now_millis()),
        });
        Ok(())
    }

    async fn list_cleanup_logs(&self, limit: u32) -> Result<Vec<CleanupRun>, StoreError> {
        let s = self.state.read().await;
        Ok(s.cleanup_runs
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
