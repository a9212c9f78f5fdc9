use tracing::warn;

use crate::store::StoreError;

/// Receives scan rows that could not be persisted.
pub trait FailureNotifier: Send + Sync {
    fn notify_failure(&self, target: &str, error: &StoreError);
}

/// Default notifier: a warning in the log and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl FailureNotifier for LogNotifier {
    fn notify_failure(&self, target: &str, error: &StoreError) {
        warn!(host = %target, error = %error, "scan result for target was not persisted");
    }
}
