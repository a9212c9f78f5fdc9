//! Recurring job scheduling: per-job runners under one manager.

mod cleanup;
mod error;
mod manager;
mod runner;

pub use cleanup::{prune_closed_scans, RetentionPolicy};
pub use error::SchedulerError;
pub use manager::{validate_job, SchedulerManager, TriggerOutcome, MAX_INTERVAL};
pub use runner::{PersistReport, RunnerState, SweepGuard, SweepPermit};
