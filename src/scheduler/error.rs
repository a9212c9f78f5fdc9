use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced by the scheduler's control operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job fields were rejected before touching the store.
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("job {0} is already active")]
    AlreadyActive(i64),

    /// A runner for this id is already registered.
    #[error("job {0} already has a live runner")]
    AlreadyRunning(i64),

    #[error("job {0} has no live runner")]
    NotRunning(i64),

    /// `stop_all` has been called; no new runners are accepted.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    /// Whether the caller, rather than the system, is at fault.
    pub fn is_client_error(&self) -> bool {
        match self {
            SchedulerError::Validation(_)
            | SchedulerError::AlreadyActive(_)
            | SchedulerError::AlreadyRunning(_)
            | SchedulerError::NotRunning(_) => true,
            SchedulerError::Store(StoreError::NotFound(_)) => true,
            SchedulerError::ShuttingDown | SchedulerError::Store(_) => false,
        }
    }
}
