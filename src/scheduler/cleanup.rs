//! Periodic removal of stale closed-port rows.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::SchedulerManager;
use crate::store::{JobStore, StoreError};
use crate::types::now_millis;

/// How long closed-port rows are kept, and how often they are pruned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub every: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60 * 60),
            every: Duration::from_secs(60 * 60),
        }
    }
}

/// Delete closed-port rows older than `max_age` and record the run. Returns the
/// number removed.
///
/// A failure to record the run is logged; the deletion still counts.
pub async fn prune_closed_scans(
    store: &dyn JobStore,
    max_age: Duration,
) -> Result<u64, StoreError> {
    let started = Instant::now();
    let cutoff = now_millis().saturating_sub(max_age.as_millis() as i64);
    let deleted = store.delete_closed_scans_before(cutoff).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if let Err(e) = store.insert_cleanup_log(deleted, elapsed_ms).await {
        warn!(error = %e, "failed to record cleanup run");
    }
    if deleted > 0 {
        info!(
            deleted,
            max_age_secs = max_age.as_secs(),
            elapsed_ms,
            "pruned closed ports"
        );
    }
    Ok(deleted)
}

impl SchedulerManager {
    /// Prune on start and then every `policy.every`, until the manager stops.
    pub fn spawn_retention_cleanup(&self, policy: RetentionPolicy) {
        let store: Arc<dyn JobStore> = Arc::clone(self.store());
        let cancel = self.root_token().child_token();
        let every = policy.every.max(Duration::from_secs(1));

        self.tracker().spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = prune_closed_scans(store.as_ref(), policy.max_age).await {
                            error!(error = %e, "cleanup failed");
                        }
                    }
                }
            }
        });
    }
}
