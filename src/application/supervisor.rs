//! RelaySupervisor - leadership election around the relay drain loop.
//!
//! Exactly one relay instance per deployment may drain the outbox at a
//! time; running two only costs duplicate deliveries (consumers dedupe on
//! event id), but the lock keeps steady-state delivery single-flight.
//!
//! Each instance contends for a TTL lock. The winner runs the drain loop
//! while a background task renews the lease; losers sleep for a standby
//! interval and contend again, so a crashed leader is replaced within one
//! TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::application::RelayProcessor;
use crate::ports::{LockError, LockManager};

/// Supervises relay leadership: acquire the lock, run the drain loop,
/// release on shutdown, stand by on contention.
pub struct RelaySupervisor {
    lock: Arc<dyn LockManager>,
    processor: Arc<RelayProcessor>,
    lock_key: String,
    lock_ttl: Duration,
    standby_interval: Duration,
}

/// Handle to a running supervisor; used for graceful shutdown.
pub struct RelayHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal shutdown and wait for the supervisor to finish its current
    /// batch and release leadership.
    pub async fn shutdown(self) {
        // Receivers may already be gone if the task finished on its own.
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "relay supervisor task failed");
        }
    }
}

impl RelaySupervisor {
    pub fn new(
        lock: Arc<dyn LockManager>,
        processor: Arc<RelayProcessor>,
        lock_key: impl Into<String>,
        lock_ttl: Duration,
        standby_interval: Duration,
    ) -> Self {
        Self {
            lock,
            processor,
            lock_key: lock_key.into(),
            lock_ttl,
            standby_interval,
        }
    }

    /// Spawn the leadership loop. Consumes the supervisor so it can only be
    /// started once.
    pub fn start(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.leadership_loop(shutdown_rx));
        RelayHandle { shutdown_tx, task }
    }

    async fn leadership_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.lock.acquire(&self.lock_key, self.lock_ttl).await {
                Ok(guard) => {
                    tracing::info!(key = %self.lock_key, "relay leadership acquired");
                    self.processor.run(shutdown.clone()).await;

                    // Drain loop only returns on shutdown; hand the lock back
                    // so a restarting peer does not wait out the TTL.
                    if let Err(e) = self.lock.release(guard).await {
                        tracing::warn!(key = %self.lock_key, error = %e, "failed to release relay lock");
                    }
                    return;
                }
                Err(LockError::Held { .. }) => {
                    tracing::debug!(key = %self.lock_key, "relay lock held elsewhere; standing by");
                }
                Err(e) => {
                    tracing::warn!(key = %self.lock_key, error = %e, "relay lock acquisition failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.standby_interval) => {}
            }
        }
    }
}
