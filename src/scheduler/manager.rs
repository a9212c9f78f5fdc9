//! Owner of the live runner set and the job control surface.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::runner::{Runner, RunnerState, SweepContext};
use super::SchedulerError;
use crate::notify::{FailureNotifier, LogNotifier};
use crate::scanner::PortProber;
use crate::store::JobStore;
use crate::types::{Job, NewJob, PortResult, SweepEvent};

const EVENT_CAPACITY: usize = 64;

/// Result of a manual trigger request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    /// A sweep was already in flight; nothing was queued.
    Skipped,
}

/// Keeps one runner alive per active job and mirrors control operations into the store.
///
/// The runner registry sits behind a single lock and never hands out runner handles.
/// Every runner token is a child of the manager's root token, so [`stop_all`]
/// reaches all of them.
///
/// [`stop_all`]: SchedulerManager::stop_all
pub struct SchedulerManager {
    ctx: SweepContext,
    root: CancellationToken,
    runners: Mutex<HashMap<i64, Runner>>,
}

impl SchedulerManager {
    pub fn new(store: Arc<dyn JobStore>, prober: Arc<dyn PortProber>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx: SweepContext {
                store,
                prober,
                notifier: Arc::new(LogNotifier),
                events,
                tracker: TaskTracker::new(),
            },
            root: CancellationToken::new(),
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Route per-row persistence failures to `notifier` instead of the log.
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.ctx.notifier = notifier;
        self
    }

    /// Parent the manager's root token under `parent`, so cancelling `parent` stops
    /// every runner too.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.root = parent.child_token();
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ctx.store
    }

    /// Completed-sweep events for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.ctx.events.subscribe()
    }

    /// Start a runner for every job persisted as active. Individual failures are
    /// logged and skipped. Returns how many runners started.
    pub async fn load_and_start_all(&self) -> Result<usize, SchedulerError> {
        let jobs = self.ctx.store.select_active_jobs().await?;
        let mut started = 0;
        for job in jobs {
            let id = job.id;
            match self.start_runner(job).await {
                Ok(()) => started += 1,
                Err(e) => error!(job_id = id, error = %e, "failed to start job"),
            }
        }
        info!(started, "loaded active jobs");
        Ok(started)
    }

    /// Validate and persist a job, starting it right away when `active`.
    ///
    /// A runner that fails to start is logged, not returned: the job stays
    /// persisted as active without a live runner.
    pub async fn create_job(
        &self,
        target: impl Into<String>,
        start_port: u16,
        end_port: u16,
        interval: Duration,
        active: bool,
    ) -> Result<i64, SchedulerError> {
        let new_job = validate_job(target.into(), start_port, end_port, interval, active)?;
        let job = self.ctx.store.insert_job(new_job).await?;
        let id = job.id;
        info!(job_id = id, host = %job.target, start_port, end_port, active, "job created");

        if active {
            if let Err(e) = self.start_runner(job).await {
                error!(job_id = id, error = %e, "created job but failed to start runner");
            }
        }
        Ok(id)
    }

    /// Activate a stored inactive job and start its runner.
    ///
    /// The store is updated first; if the runner then fails to start the error is
    /// returned and the row stays active.
    pub async fn start_job_by_id(&self, id: i64) -> Result<(), SchedulerError> {
        let mut job = self.ctx.store.select_job_by_id(id).await?;
        if job.active {
            return Err(SchedulerError::AlreadyActive(id));
        }

        self.ctx.store.set_active(id, true).await?;
        job.active = true;
        self.start_runner(job).await.inspect_err(|e| {
            error!(job_id = id, error = %e, "job marked active but runner failed to start");
        })
    }

    /// Cancel the job's runner if it has one, then mark it inactive.
    ///
    /// Idempotent: a missing runner is not an error. Does not wait for an
    /// in-flight sweep to finish.
    pub async fn stop_job(&self, id: i64) -> Result<(), SchedulerError> {
        let runner = self.runners.lock().await.remove(&id);
        if let Some(runner) = runner {
            runner.cancel();
            info!(job_id = id, state = ?runner.state(), "runner cancelled");
        }

        self.ctx.store.set_active(id, false).await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: i64) -> Result<(), SchedulerError> {
        if let Err(e) = self.stop_job(id).await {
            warn!(job_id = id, error = %e, "stop before delete failed");
        }
        self.ctx.store.delete_job(id).await?;
        info!(job_id = id, "job deleted");
        Ok(())
    }

    /// Store snapshot, newest first. Runner state is not merged in.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.ctx.store.list_jobs().await?)
    }

    pub async fn get_job(&self, id: i64) -> Result<Job, SchedulerError> {
        Ok(self.ctx.store.select_job_by_id(id).await?)
    }

    /// Request an immediate sweep of a live job through its in-flight guard.
    pub async fn trigger_job(&self, id: i64) -> Result<TriggerOutcome, SchedulerError> {
        let runners = self.runners.lock().await;
        let runner = runners
            .get(&id)
            .filter(|r| r.state() != RunnerState::Cancelled)
            .ok_or(SchedulerError::NotRunning(id))?;
        if self.ctx.dispatch(runner.job(), runner.guard()) {
            Ok(TriggerOutcome::Started)
        } else {
            Ok(TriggerOutcome::Skipped)
        }
    }

    /// Probe a range once, outside any job. The results are persisted and published
    /// like a scheduled sweep and returned to the caller.
    pub async fn scan_now(
        &self,
        target: impl Into<String>,
        start_port: u16,
        end_port: u16,
    ) -> Result<Vec<PortResult>, SchedulerError> {
        let target = validate_range(target.into(), start_port, end_port)?;
        if self.root.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        info!(host = %target, start_port, end_port, "running one-shot scan");
        Ok(self.ctx.sweep(None, &target, start_port, end_port).await)
    }

    pub async fn runner_state(&self, id: i64) -> Option<RunnerState> {
        self.runners.lock().await.get(&id).map(Runner::state)
    }

    /// Ids of registered runners whose loop has not exited.
    pub async fn live_runner_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .runners
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.state() != RunnerState::Cancelled)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Runner loops and sweeps (plus background maintenance) not yet finished.
    pub fn outstanding_tasks(&self) -> usize {
        self.ctx.tracker.len()
    }

    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.ctx.tracker
    }

    /// Cancel every runner and wait until all runner loops and in-flight sweeps
    /// have exited. The manager accepts no new runners afterwards.
    pub async fn stop_all(&self) {
        self.root.cancel();
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;
        self.runners.lock().await.clear();
        info!("scheduler stopped");
    }

    async fn start_runner(&self, job: Job) -> Result<(), SchedulerError> {
        let mut runners = self.runners.lock().await;
        if self.root.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        // an exited loop leaves a cancelled entry behind; it may be replaced
        if runners
            .get(&job.id)
            .is_some_and(|r| r.state() != RunnerState::Cancelled)
        {
            return Err(SchedulerError::AlreadyRunning(job.id));
        }

        let id = job.id;
        let runner = Runner::spawn(job, &self.root, self.ctx.clone());
        runners.insert(id, runner);
        info!(job_id = id, "runner started");
        Ok(())
    }
}

/// Longest accepted job interval: one year.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Check job fields and normalise them into a [`NewJob`].
///
/// Intervals are persisted in whole seconds, so anything under one second is rejected,
/// as is anything over [`MAX_INTERVAL`].
pub fn validate_job(
    target: String,
    start_port: u16,
    end_port: u16,
    interval: Duration,
    active: bool,
) -> Result<NewJob, SchedulerError> {
    let target = validate_range(target, start_port, end_port)?;
    let interval_seconds = interval.as_secs();
    if interval_seconds == 0 {
        return Err(SchedulerError::Validation(
            "interval must be at least one second".into(),
        ));
    }
    if interval > MAX_INTERVAL {
        return Err(SchedulerError::Validation(format!(
            "interval must be at most {} seconds",
            MAX_INTERVAL.as_secs()
        )));
    }
    Ok(NewJob {
        target,
        start_port,
        end_port,
        interval_seconds,
        active,
    })
}

/// Trimmed target, non-zero ports, `start_port <= end_port`.
fn validate_range(
    target: String,
    start_port: u16,
    end_port: u16,
) -> Result<String, SchedulerError> {
    let target = target.trim().to_string();
    if target.is_empty() {
        return Err(SchedulerError::Validation("target must not be empty".into()));
    }
    if start_port == 0 || end_port == 0 {
        return Err(SchedulerError::Validation("ports must be in 1..=65535".into()));
    }
    if start_port > end_port {
        return Err(SchedulerError::Validation(format!(
            "start_port {start_port} is greater than end_port {end_port}"
        )));
    }
    Ok(target)
}
