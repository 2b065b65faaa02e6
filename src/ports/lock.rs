//! LockManager port - distributed mutual exclusion with lease auto-renewal.
//!
//! Used to elect a single active relay per deployment and to keep
//! maintenance jobs single-flight across instances. A lock is a namespaced
//! key, an opaque owner token regenerated per acquisition, and a TTL lease
//! renewed in the background while the guard is alive.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors surfaced by lock implementations.
///
/// `Held` is an expected, non-exceptional outcome: callers use it to decide
/// "skip, someone else is doing it" as opposed to `Backend`, which means
/// the coordination store itself is broken.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock; acquisition retries were exhausted.
    #[error("lock already held: {key}")]
    Held { key: String },

    /// Release was attempted with a token that no longer owns the lock.
    #[error("lock not held by this owner: {key}")]
    NotHeld { key: String },

    /// The coordination store failed at the transport level.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Proof of lock ownership.
///
/// Holds the owner token and the handle of the background renewal task.
/// Dropping the guard stops renewal, so an abandoned lock expires within
/// one TTL of the last renewal; it does not release the lock eagerly -
/// pass the guard back to [`LockManager::release`] for that.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    token: String,
    renewal: Option<JoinHandle<()>>,
}

impl LockGuard {
    /// Creates a guard without a renewal task.
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
            renewal: None,
        }
    }

    /// Attaches the background renewal task.
    pub fn with_renewal(mut self, handle: JoinHandle<()>) -> Self {
        self.renewal = Some(handle);
        self
    }

    /// The namespaced lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner token for this acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stops the renewal task, if any.
    pub fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

/// Port for distributed mutual exclusion.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Atomic "set if not present" with a fresh owner token. On contention,
    /// retries a bounded number of times with fixed backoff, then fails
    /// with [`LockError::Held`].
    ///
    /// While the returned guard is alive, a background task extends the
    /// lease at roughly two-thirds of the TTL.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError>;

    /// Compare-and-delete keyed on the owner token: only the current holder
    /// may release. Releasing a lock you no longer hold returns
    /// [`LockError::NotHeld`].
    async fn release(&self, guard: LockGuard) -> Result<(), LockError>;
}

/// Scoped-execution extension: acquire, run, always release.
///
/// If the closure's future panics, the guard is dropped during unwind,
/// renewal stops, and the lease lapses within one TTL.
#[async_trait]
pub trait LockManagerExt: LockManager {
    /// Run `f` while holding `key`, releasing the lock afterwards whether
    /// or not `f`'s output represents success.
    async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T, LockError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send;
}

#[async_trait]
impl<L: LockManager + ?Sized> LockManagerExt for L {
    async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T, LockError>
    where
        T: Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let guard = self.acquire(key, ttl).await?;
        let outcome = f().await;
        if let Err(e) = self.release(guard).await {
            // The work itself succeeded; a failed release only shortens the
            // lease to its natural expiry.
            tracing::warn!(key, error = %e, "failed to release lock");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn LockManager) {}

    #[test]
    fn guard_exposes_key_and_token() {
        let guard = LockGuard::new("relay:lock:outbox-relay", "token-1");
        assert_eq!(guard.key(), "relay:lock:outbox-relay");
        assert_eq!(guard.token(), "token-1");
    }

    #[tokio::test]
    async fn dropping_guard_aborts_renewal_task() {
        let handle = tokio::spawn(async {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        let aborter = handle.abort_handle();

        let guard = LockGuard::new("k", "t").with_renewal(handle);
        drop(guard);

        // Give the runtime a moment to observe the abort.
        for _ in 0..100 {
            if aborter.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(aborter.is_finished());
    }
}
