//! In-memory lock manager for testing.
//!
//! Same ownership model as the Redis adapter: token-guarded leases with a
//! deadline, background renewal at two-thirds of the TTL, and
//! compare-and-delete release. Deadlines use `tokio::time::Instant` so
//! tests can drive expiry with paused time.
//!
//! # Security Note
//!
//! This adapter is for **testing only**. It uses `.expect()` on lock
//! operations which will panic if locks are poisoned; production code uses
//! the Redis adapter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ports::{LockError, LockGuard, LockManager};

struct Lease {
    token: String,
    deadline: Instant,
}

/// In-memory lock manager for testing.
///
/// # Panics
///
/// Methods may panic if the internal lock is poisoned. Acceptable for test
/// code only.
#[derive(Clone)]
pub struct InMemoryLockManager {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    acquire_retries: u32,
    retry_backoff: Duration,
}

impl InMemoryLockManager {
    /// Creates a manager with no acquisition retries.
    pub fn new() -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            acquire_retries: 0,
            retry_backoff: Duration::from_millis(10),
        }
    }

    /// Additional acquisition attempts after the first before giving up.
    pub fn with_acquire_retries(mut self, retries: u32) -> Self {
        self.acquire_retries = retries;
        self
    }

    /// Fixed delay between acquisition attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    // === Test Helpers ===

    /// True while a live (unexpired) lease exists for `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .expect("InMemoryLockManager: lock poisoned")
            .get(key)
            .is_some_and(|lease| lease.deadline > Instant::now())
    }

    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let mut leases = self
            .leases
            .lock()
            .expect("InMemoryLockManager: lock poisoned");

        match leases.get(key) {
            Some(lease) if lease.deadline > Instant::now() => false,
            _ => {
                // Absent or expired: take over.
                leases.insert(
                    key.to_string(),
                    Lease {
                        token: token.to_string(),
                        deadline: Instant::now() + ttl,
                    },
                );
                true
            }
        }
    }

    fn spawn_renewal(
        &self,
        key: String,
        token: String,
        ttl: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let leases = Arc::clone(&self.leases);
        let interval = ttl * 2 / 3;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately

            loop {
                ticker.tick().await;

                let mut leases = leases.lock().expect("InMemoryLockManager: lock poisoned");
                match leases.get_mut(&key) {
                    Some(lease) if lease.token == token && lease.deadline > Instant::now() => {
                        lease.deadline = Instant::now() + ttl;
                    }
                    _ => {
                        tracing::warn!(key, "lock lease lost; stopping renewal");
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();

        for attempt in 0..=self.acquire_retries {
            if self.try_acquire(key, &token, ttl) {
                let renewal = self.spawn_renewal(key.to_string(), token.clone(), ttl);
                return Ok(LockGuard::new(key, token).with_renewal(renewal));
            }

            if attempt < self.acquire_retries {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(LockError::Held {
            key: key.to_string(),
        })
    }

    async fn release(&self, mut guard: LockGuard) -> Result<(), LockError> {
        guard.stop_renewal();

        let mut leases = self
            .leases
            .lock()
            .expect("InMemoryLockManager: lock poisoned");

        match leases.get(guard.key()) {
            Some(lease) if lease.token == guard.token() && lease.deadline > Instant::now() => {
                leases.remove(guard.key());
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                key: guard.key().to_string(),
            }),
        }
    }
}
