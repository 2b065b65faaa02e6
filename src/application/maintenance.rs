//! Maintenance jobs - outbox retention sweep.
//!
//! Published rows have served their purpose once consumers have had a
//! chance to read them; the sweep deletes those older than the retention
//! window. It runs under the same lock manager as the relay so the delete
//! stays single-flight when every instance schedules it.

use std::time::Duration;
use thiserror::Error;

use crate::domain::foundation::Timestamp;
use crate::ports::{LockError, LockManager, LockManagerExt, OutboxError, OutboxStore};

/// Lock key for the retention sweep, distinct from relay leadership.
pub const PURGE_LOCK_KEY: &str = "outbox-purge";

/// Errors surfaced by maintenance jobs.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// What a purge invocation did.
#[derive(Debug, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// This instance held the lock and deleted the given number of rows.
    Purged(u64),

    /// Another instance was already sweeping; nothing to do here.
    Skipped,
}

/// Delete published outbox rows older than `retention_hours`.
///
/// Lock contention is a normal outcome ([`PurgeOutcome::Skipped`]), not an
/// error; only backend failures propagate.
pub async fn purge_published(
    store: &dyn OutboxStore,
    lock: &dyn LockManager,
    lock_ttl: Duration,
    retention_hours: u32,
) -> Result<PurgeOutcome, MaintenanceError> {
    let cutoff = Timestamp::now().minus_hours(retention_hours as i64);

    let swept = lock
        .with_lock(PURGE_LOCK_KEY, lock_ttl, || async {
            store.delete_published_before(cutoff).await
        })
        .await;

    match swept {
        Ok(Ok(deleted)) => {
            if deleted > 0 {
                tracing::info!(deleted, retention_hours, "purged published outbox rows");
            }
            Ok(PurgeOutcome::Purged(deleted))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(LockError::Held { .. }) => Ok(PurgeOutcome::Skipped),
        Err(e) => Err(e.into()),
    }
}
