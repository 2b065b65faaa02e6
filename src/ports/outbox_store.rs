//! OutboxStore port - Interface for transactional event persistence.
//!
//! This port implements the Transactional Outbox Pattern, which ensures
//! events are persisted in the same transaction as the business mutation
//! that produced them, guaranteeing no events are lost even if the
//! application crashes before the broker accepts them.
//!
//! ## Pattern Overview
//!
//! 1. A business service saves its aggregate AND the event in one DB transaction
//! 2. The relay (background service) reads pending events oldest-first
//! 3. The relay publishes to the stream bus and marks events published/failed
//! 4. Consumers receive events through `StreamSubscriber`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{Postgres, Transaction};
use thiserror::Error;

use crate::domain::foundation::{EventId, Timestamp};

/// Errors surfaced by outbox store implementations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The event is structurally invalid and was never persisted.
    #[error("invalid outbox event: {0}")]
    Validation(String),

    /// No row exists for the given event id.
    #[error("outbox event not found: {0}")]
    NotFound(EventId),

    /// The underlying store could not be reached or rejected the query.
    #[error("outbox database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Status of an outbox event in the delivery pipeline.
///
/// The `Dq*` variants model a dead-letter reprocessing path. They are part
/// of the persisted row shape and round-trip through the store, but the
/// relay loop does not consume them; moving events into the dead-letter
/// lane is an operator-driven action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Event written but not yet published (or awaiting retry)
    Pending,
    /// Event successfully published to the stream bus
    Published,
    /// Event exhausted its retry budget; terminal
    Failed,
    /// Dead-letter copy awaiting reprocessing
    DqPending,
    /// Dead-letter copy successfully republished
    DqPublished,
    /// Dead-letter reprocessing failed
    DqFailed,
}

impl OutboxStatus {
    /// Returns true for any status that represents a successful publish.
    pub fn is_published(self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DqPublished)
    }
}

/// An event row in the outbox table: the unit of durable intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Internal numeric id (0 until persisted).
    pub id: i64,

    /// Globally unique id, generated at creation, carried end-to-end for dedup.
    pub event_id: EventId,

    /// Routing key; doubles as the stream/topic name.
    pub event_type: String,

    /// Business entity that produced the event.
    pub aggregate_id: String,

    /// Type of the business entity (e.g. "Problem", "Submission").
    pub aggregate_type: String,

    /// Opaque serialized payload, immutable once written.
    pub payload: JsonValue,

    /// Current delivery status.
    pub status: OutboxStatus,

    /// Number of failed publish attempts. Monotonically non-decreasing.
    pub retry_count: u32,

    /// Last failure reason, for operators.
    pub error_message: Option<String>,

    /// When the event was written. Immutable; defines FIFO order.
    pub created_at: Timestamp,

    /// Set on first successful publish, then immutable.
    pub published_at: Option<Timestamp>,

    /// Soft-delete marker used by retention cleanup.
    pub deleted_at: Option<Timestamp>,
}

impl OutboxEvent {
    /// Creates a new pending event with a fresh `event_id`.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Self, OutboxError> {
        let event = Self {
            id: 0,
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Timestamp::now(),
            published_at: None,
            deleted_at: None,
        };
        event.validate()?;
        Ok(event)
    }

    /// Replaces the generated event id (test fixtures, imported events).
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Checks the row invariants a store must reject on create.
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.event_id.is_empty() {
            return Err(OutboxError::Validation("event_id is empty".into()));
        }
        if self.event_type.is_empty() {
            return Err(OutboxError::Validation("event_type is empty".into()));
        }
        if self.payload.is_null() {
            return Err(OutboxError::Validation("payload is empty".into()));
        }
        Ok(())
    }

    /// Transition: record a successful publish.
    ///
    /// Idempotent - calling on an already-published event changes nothing,
    /// so `published_at` stays at the first successful publish.
    pub fn mark_published(&mut self) {
        if self.status.is_published() {
            return;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(Timestamp::now());
    }

    /// Transition: record a failed publish attempt.
    ///
    /// Increments `retry_count` by exactly one and stores the error. The
    /// event stays `Pending` while attempts remain, and flips to the
    /// terminal `Failed` once `retry_count` reaches `max_retries`.
    pub fn mark_failed(&mut self, error: impl Into<String>, max_retries: u32) {
        if self.status.is_published() {
            return;
        }
        self.retry_count += 1;
        self.error_message = Some(error.into());
        self.status = if self.retry_count >= max_retries {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };
    }
}

/// Port for the durable outbox table.
///
/// Implementations must:
/// - Persist `create_in_tx` writes atomically with the caller's transaction
/// - Return pending rows oldest-first (advisory ordering, not a total order)
/// - Keep `mark_published` idempotent
/// - Apply the conditional retry policy in `mark_failed` (an event stays
///   pending until its retry budget is exhausted)
///
/// # Example
///
/// ```ignore
/// // In a business service:
/// let mut tx = pool.begin().await?;
/// problem_repo.save_in_tx(&problem, &mut tx).await?;
/// let event = OutboxEvent::new("problem.created", problem.id(), "Problem", payload)?;
/// outbox.create_in_tx(&mut tx, &event).await?;
/// tx.commit().await?;
/// notifier.notify(); // optional low-latency wake-up for the relay
/// ```
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new event with status=pending, retry_count=0.
    async fn create(&self, event: &OutboxEvent) -> Result<(), OutboxError>;

    /// Persist a new event inside a caller-managed transaction, so the
    /// business write and the intent-to-publish commit or roll back together.
    async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<(), OutboxError>;

    /// Pending events with `retry_count < max_retries`, ordered by
    /// `created_at` ascending, at most `limit` rows.
    async fn get_pending(
        &self,
        limit: u32,
        max_retries: u32,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Mark an event published. Re-invoking on an already-published id is a
    /// no-op.
    async fn mark_published(&self, event_id: &EventId) -> Result<(), OutboxError>;

    /// Record a failed publish attempt: `retry_count += 1`, store the error,
    /// flip to terminal `failed` once the budget is exhausted.
    async fn mark_failed(
        &self,
        event_id: &EventId,
        error: &str,
        max_retries: u32,
    ) -> Result<(), OutboxError>;

    /// Retention sweep: delete only published rows with
    /// `published_at < cutoff`. Never touches pending/failed rows.
    async fn delete_published_before(&self, cutoff: Timestamp) -> Result<u64, OutboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_event() -> OutboxEvent {
        OutboxEvent::new("problem.created", "prob-1", "Problem", json!({"title": "Two Sum"}))
            .unwrap()
    }

    #[test]
    fn new_event_starts_pending_with_zero_retries() {
        let event = test_event();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 0);
        assert!(event.published_at.is_none());
        assert!(!event.event_id.is_empty());
    }

    #[test]
    fn new_event_rejects_empty_event_type() {
        let result = OutboxEvent::new("", "agg-1", "Problem", json!({}));
        assert!(matches!(result, Err(OutboxError::Validation(_))));
    }

    #[test]
    fn new_event_rejects_null_payload() {
        let result = OutboxEvent::new("problem.created", "agg-1", "Problem", JsonValue::Null);
        assert!(matches!(result, Err(OutboxError::Validation(_))));
    }

    #[test]
    fn mark_published_sets_status_and_timestamp_once() {
        let mut event = test_event();
        event.mark_published();

        assert_eq!(event.status, OutboxStatus::Published);
        let first = event.published_at;
        assert!(first.is_some());

        // Idempotent: a second call keeps the original timestamp.
        event.mark_published();
        assert_eq!(event.published_at, first);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn mark_failed_keeps_pending_while_budget_remains() {
        let mut event = test_event();
        event.mark_failed("broker unavailable", 3);

        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.error_message.as_deref(), Some("broker unavailable"));
    }

    #[test]
    fn mark_failed_flips_to_terminal_at_budget() {
        let mut event = test_event();
        for _ in 0..3 {
            event.mark_failed("timeout", 3);
        }

        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(event.retry_count, 3);
        assert!(event.published_at.is_none());
    }

    #[test]
    fn mark_failed_after_publish_is_a_no_op() {
        let mut event = test_event();
        event.mark_published();
        event.mark_failed("late failure", 3);

        assert_eq!(event.status, OutboxStatus::Published);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&OutboxStatus::DqPending).unwrap(),
            r#""dq_pending""#
        );
        assert_eq!(
            serde_json::to_string(&OutboxStatus::Pending).unwrap(),
            r#""pending""#
        );
    }

    proptest! {
        /// retry_count only ever grows, by exactly one per failure, and
        /// published_at appears iff the status is a published variant.
        #[test]
        fn retry_count_is_monotone(ops in proptest::collection::vec(any::<bool>(), 0..20)) {
            let mut event = test_event();
            let mut last_retry = 0u32;

            for publish in ops {
                if publish {
                    event.mark_published();
                } else {
                    event.mark_failed("err", 5);
                }
                prop_assert!(event.retry_count >= last_retry);
                prop_assert!(event.retry_count - last_retry <= 1);
                last_retry = event.retry_count;
                prop_assert_eq!(event.published_at.is_some(), event.status.is_published());
            }
        }
    }
}
