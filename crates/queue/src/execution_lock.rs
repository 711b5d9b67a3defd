//! Cross-worker mutual exclusion over one deviation.
//!
//! The lock is a lease stamped on the deviation row by a conditional
//! update. A worker that dies while holding it is recovered once the lease
//! is older than the staleness threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::store::PublishStore;

/// Lease-based execution lock.
#[derive(Clone)]
pub struct ExecutionLockManager {
    store: Arc<dyn PublishStore>,
    stale_after: Duration,
}

impl ExecutionLockManager {
    /// Create a manager whose leases go stale after `stale_after`.
    #[must_use]
    pub fn new(store: Arc<dyn PublishStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Try to take the lease. Store errors count as "not acquired".
    pub async fn acquire(&self, deviation_id: &str, lease_id: &str) -> bool {
        let stale_for =
            chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        let stale_before = Utc::now()
            .checked_sub_signed(stale_for)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self
            .store
            .try_acquire_lease(deviation_id, lease_id, stale_before)
            .await
        {
            Ok(true) => {
                debug!(deviation_id = %deviation_id, lease_id = %lease_id, "Lock acquired");
                true
            }
            Ok(false) => {
                debug!(deviation_id = %deviation_id, "Execution lock held by another worker");
                false
            }
            Err(e) => {
                error!(deviation_id = %deviation_id, error = %e, "Failed to acquire lock");
                false
            }
        }
    }

    /// Give the lease back. Errors are logged; the staleness timeout
    /// recovers the row.
    pub async fn release(&self, deviation_id: &str, lease_id: &str) {
        match self.store.release_lease(deviation_id, lease_id).await {
            Ok(true) => debug!(deviation_id = %deviation_id, "Execution lock released"),
            Ok(false) => {
                warn!(
                    deviation_id = %deviation_id,
                    lease_id = %lease_id,
                    "Execution lock was already reclaimed"
                );
            }
            Err(e) => {
                warn!(deviation_id = %deviation_id, error = %e, "Failed to release execution lock");
            }
        }
    }
}
