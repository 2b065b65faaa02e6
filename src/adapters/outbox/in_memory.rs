//! In-memory outbox store for testing.
//!
//! Implements the same status/retry semantics as the PostgreSQL store so
//! the relay can be exercised without a database.
//!
//! # Security Note
//!
//! This adapter is for **testing only**. It uses `.expect()` on lock
//! operations which will panic if locks are poisoned; production code uses
//! the PostgreSQL adapter.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use std::sync::Mutex;

use crate::domain::foundation::{EventId, Timestamp};
use crate::ports::{OutboxError, OutboxEvent, OutboxStatus, OutboxStore};

/// In-memory outbox store for testing.
///
/// # Panics
///
/// Methods may panic if the internal lock is poisoned. Acceptable for test
/// code only.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    events: Mutex<Vec<OutboxEvent>>,
}

impl InMemoryOutboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // === Test Helpers ===

    /// Returns a snapshot of every stored event.
    pub fn all(&self) -> Vec<OutboxEvent> {
        self.events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned")
            .clone()
    }

    /// Looks up a single event by id.
    pub fn get(&self, event_id: &EventId) -> Option<OutboxEvent> {
        self.all().into_iter().find(|e| &e.event_id == event_id)
    }

    /// Counts events currently in the given status.
    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.all().iter().filter(|e| e.status == status).count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn create(&self, event: &OutboxEvent) -> Result<(), OutboxError> {
        event.validate()?;
        let mut events = self
            .events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");

        if events.iter().any(|e| e.event_id == event.event_id) {
            return Err(OutboxError::Validation(format!(
                "duplicate event_id: {}",
                event.event_id
            )));
        }

        let mut stored = event.clone();
        stored.id = events.len() as i64 + 1;
        events.push(stored);
        Ok(())
    }

    async fn create_in_tx(
        &self,
        _tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), OutboxError> {
        // No transactional coupling in memory; behaves like `create`.
        self.create(event).await
    }

    async fn get_pending(
        &self,
        limit: u32,
        max_retries: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let events = self
            .events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");

        let mut pending: Vec<OutboxEvent> = events
            .iter()
            .filter(|e| {
                e.status == OutboxStatus::Pending
                    && e.retry_count < max_retries
                    && e.deleted_at.is_none()
            })
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn mark_published(&self, event_id: &EventId) -> Result<(), OutboxError> {
        let mut events = self
            .events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");

        let event = events
            .iter_mut()
            .find(|e| &e.event_id == event_id)
            .ok_or_else(|| OutboxError::NotFound(event_id.clone()))?;
        event.mark_published();
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<(), OutboxError> {
        let mut events = self
            .events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");

        let event = events
            .iter_mut()
            .find(|e| &e.event_id == event_id)
            .ok_or_else(|| OutboxError::NotFound(event_id.clone()))?;
        event.mark_failed(error, max_retries);
        Ok(())
    }

    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError> {
        let mut events = self
            .events
            .lock()
            .expect("InMemoryOutboxStore: lock poisoned");

        let before = events.len();
        events.retain(|e| {
            !(e.status == OutboxStatus::Published
                && e.published_at.is_some_and(|at| at.is_before(&cutoff)))
        });
        Ok((before - events.len()) as u64)
    }
}
