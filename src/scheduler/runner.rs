//! One job's recurring lifecycle: a tick loop, a single-flight guard and a
//! cancellation token parented to the manager's root token.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::notify::FailureNotifier;
use crate::scanner::PortProber;
use crate::store::JobStore;
use crate::types::{now_rfc3339, Job, PortResult, SweepEvent};

/// Lifecycle of a runner.
///
/// `Idle -> Running <-> Executing -> Cancelled`. Only [`SweepGuard::try_begin`] moves a
/// runner into `Executing`, and only from `Running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Running,
    Executing,
    Cancelled,
}

/// Single-flight guard for one job's sweeps.
#[derive(Debug)]
pub struct SweepGuard {
    state: Mutex<RunnerState>,
}

impl Default for SweepGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunnerState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunnerState {
        *self.lock()
    }

    /// `Idle -> Running`. Returns false from any other state.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        if *state == RunnerState::Idle {
            *state = RunnerState::Running;
            true
        } else {
            false
        }
    }

    /// `Running -> Executing`; `None` when a sweep is already in flight or the
    /// runner is not running. Dropping the permit ends the sweep.
    pub fn try_begin(self: &Arc<Self>) -> Option<SweepPermit> {
        let mut state = self.lock();
        if *state != RunnerState::Running {
            return None;
        }
        *state = RunnerState::Executing;
        Some(SweepPermit {
            guard: Arc::clone(self),
        })
    }

    /// Terminal. An in-flight sweep keeps its permit and finishes normally.
    pub fn cancel(&self) {
        *self.lock() = RunnerState::Cancelled;
    }
}

/// Proof that a sweep is in flight; releases the guard on drop.
#[derive(Debug)]
pub struct SweepPermit {
    guard: Arc<SweepGuard>,
}

impl Drop for SweepPermit {
    fn drop(&mut self) {
        let mut state = self.guard.lock();
        if *state == RunnerState::Executing {
            *state = RunnerState::Running;
        }
    }
}

/// How a sweep's rows reached the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub persisted: usize,
    pub failed: usize,
    /// The batch transaction failed and rows were written one by one.
    pub degraded: bool,
}

/// Everything a sweep needs, shared by every runner of one manager.
#[derive(Clone)]
pub(crate) struct SweepContext {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) prober: Arc<dyn PortProber>,
    pub(crate) notifier: Arc<dyn FailureNotifier>,
    pub(crate) events: broadcast::Sender<SweepEvent>,
    pub(crate) tracker: TaskTracker,
}

impl SweepContext {
    /// Spawn a sweep for `job` if the guard allows one. Returns whether it did.
    pub(crate) fn dispatch(&self, job: &Job, guard: &Arc<SweepGuard>) -> bool {
        let Some(permit) = guard.try_begin() else {
            return false;
        };
        let ctx = self.clone();
        let job = job.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            ctx.execute(&job).await;
        });
        true
    }

    async fn execute(&self, job: &Job) {
        info!(job_id = job.id, host = %job.target, "running recurring scan");
        self.sweep(Some(job.id), &job.target, job.start_port, job.end_port)
            .await;
    }

    /// Probe the range, persist the results and publish a [`SweepEvent`].
    pub(crate) async fn sweep(
        &self,
        job_id: Option<i64>,
        target: &str,
        start_port: u16,
        end_port: u16,
    ) -> Vec<PortResult> {
        let started = Instant::now();
        let results = self.prober.probe_range(target, start_port, end_port).await;
        let report = self.persist(target, &results).await;
        info!(
            job_id = ?job_id,
            host = %target,
            ports = results.len(),
            open = results.iter().filter(|r| r.is_open).count(),
            persisted = report.persisted,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sweep finished"
        );

        // no subscribers is fine
        let _ = self.events.send(SweepEvent {
            job_id,
            target: target.to_string(),
            results: results.clone(),
            finished_at: now_rfc3339(),
        });
        results
    }

    /// Write a sweep in one transaction, falling back to independent row writes.
    pub(crate) async fn persist(&self, target: &str, results: &[PortResult]) -> PersistReport {
        match self.store.insert_scan_batch(target, results).await {
            Ok(()) => PersistReport {
                persisted: results.len(),
                failed: 0,
                degraded: false,
            },
            Err(e) => {
                warn!(
                    host = %target,
                    rows = results.len(),
                    error = %e,
                    "batch write failed, degrading to per-row writes"
                );
                let mut report = PersistReport {
                    degraded: true,
                    ..PersistReport::default()
                };
                for r in results {
                    match self.store.insert_scan_result(target, r).await {
                        Ok(()) => report.persisted += 1,
                        Err(e) => {
                            report.failed += 1;
                            error!(host = %target, port = r.port, error = %e, "scan insert failed");
                            self.notifier.notify_failure(target, &e);
                        }
                    }
                }
                report
            }
        }
    }
}

/// Registry entry for a live job. Owned by the manager only.
#[derive(Debug)]
pub(crate) struct Runner {
    job: Job,
    cancel: CancellationToken,
    guard: Arc<SweepGuard>,
}

impl Runner {
    /// Start ticking `job` under a child of `parent`. The first sweep is dispatched
    /// immediately; the next one after a full interval.
    pub(crate) fn spawn(job: Job, parent: &CancellationToken, ctx: SweepContext) -> Self {
        let cancel = parent.child_token();
        let guard = Arc::new(SweepGuard::new());
        guard.start();

        let tracker = ctx.tracker.clone();
        tracker.spawn(run_loop(job.clone(), cancel.clone(), guard.clone(), ctx));

        Self { job, cancel, guard }
    }

    pub(crate) fn job(&self) -> &Job {
        &self.job
    }

    pub(crate) fn guard(&self) -> &Arc<SweepGuard> {
        &self.guard
    }

    pub(crate) fn state(&self) -> RunnerState {
        self.guard.state()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

async fn run_loop(
    job: Job,
    cancel: CancellationToken,
    guard: Arc<SweepGuard>,
    ctx: SweepContext,
) {
    let period = job.interval();
    let Some(first_tick) = Instant::now().checked_add(period) else {
        error!(
            job_id = job.id,
            interval_secs = period.as_secs(),
            "interval out of range, job not scheduled"
        );
        guard.cancel();
        return;
    };
    if !cancel.is_cancelled() {
        ctx.dispatch(&job, &guard);
    }

    let mut ticker = time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if !ctx.dispatch(&job, &guard) {
                    debug!(job_id = job.id, "previous sweep still in flight, skipping tick");
                }
            }
        }
    }

    guard.cancel();
    info!(job_id = job.id, "job stopped");
}
