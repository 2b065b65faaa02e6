//! StreamBus ports - append-only log with consumer-group semantics.
//!
//! `StreamPublisher` appends messages to a per-topic log; `StreamSubscriber`
//! joins a named consumer group on a topic, delivering each message to
//! exactly one group member and redelivering unacknowledged messages after
//! a crash.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::foundation::{EventId, Timestamp};

/// Metadata key for the id of the aggregate that produced the event.
pub const META_AGGREGATE_ID: &str = "aggregate_id";

/// Metadata key for the type of the aggregate that produced the event.
pub const META_AGGREGATE_TYPE: &str = "aggregate_type";

/// Errors surfaced by stream bus implementations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached.
    #[error("stream connection failed: {0}")]
    Connection(String),

    /// The append was rejected or the broker never acknowledged it.
    #[error("stream publish failed: {0}")]
    Publish(String),

    /// Reading from the stream failed at the transport level.
    #[error("stream consume failed: {0}")]
    Consume(String),

    /// Consumer-group creation failed for a reason other than the group
    /// already existing (which is swallowed).
    #[error("consumer group setup failed: {0}")]
    GroupCreate(String),

    /// A delivered record could not be decoded into a `Message`.
    #[error("malformed stream record: {0}")]
    Decode(String),

    /// A handler reported a processing failure; the message stays unacked.
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Wire unit on the stream bus.
///
/// Core fields (`id`, `key`, `payload`, `occurred_at`, `published_at`) and
/// metadata are kept distinct on the wire so metadata round-trips
/// losslessly. Metadata always carries [`META_AGGREGATE_ID`] and
/// [`META_AGGREGATE_TYPE`] so consumers can correlate without
/// deserializing the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// End-to-end unique id, used by consumers for deduplication.
    pub id: EventId,

    /// Topic (stream name) this message belongs to.
    pub topic: String,

    /// Optional partition key.
    pub key: Option<String>,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// String-keyed metadata, distinct from the core fields.
    pub metadata: HashMap<String, String>,

    /// Business time: when the event happened.
    pub occurred_at: Timestamp,

    /// Transport time: when the message entered the log.
    pub published_at: Option<Timestamp>,
}

impl Message {
    /// Creates a message with empty metadata and no partition key.
    pub fn new(topic: impl Into<String>, id: EventId, payload: Vec<u8>) -> Self {
        Self {
            id,
            topic: topic.into(),
            key: None,
            payload,
            metadata: HashMap::new(),
            occurred_at: Timestamp::now(),
            published_at: None,
        }
    }

    /// Sets the partition key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the business time.
    pub fn with_occurred_at(mut self, at: Timestamp) -> Self {
        self.occurred_at = at;
        self
    }

    /// Convenience accessor for [`META_AGGREGATE_ID`].
    pub fn aggregate_id(&self) -> Option<&str> {
        self.metadata.get(META_AGGREGATE_ID).map(String::as_str)
    }

    /// Convenience accessor for [`META_AGGREGATE_TYPE`].
    pub fn aggregate_type(&self) -> Option<&str> {
        self.metadata.get(META_AGGREGATE_TYPE).map(String::as_str)
    }
}

/// Handler for messages delivered through a consumer group.
///
/// Delivery is at-least-once: implementations must be idempotent, using
/// `message.id` for deduplication.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a delivered message. Returning `Ok` acknowledges it;
    /// returning `Err` leaves it pending for redelivery.
    async fn handle(&self, message: Message) -> Result<(), BusError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Port for appending to the log.
///
/// `publish` returns only once the broker has durably accepted the record
/// and must tolerate concurrent calls from many tasks.
#[async_trait]
pub trait StreamPublisher: Send + Sync {
    /// Append `message` to the log for `message.topic`.
    async fn publish(&self, message: &Message) -> Result<(), BusError>;
}

/// Port for consumer-group reads.
///
/// `subscribe` runs the read loop on the calling task until `shutdown`
/// flips to true; callers spawn it. Competing consumers in the same group
/// each receive a disjoint subset of messages. The group is created if
/// absent, tolerating a race where another instance creates it first.
///
/// Known gap: unacknowledged messages of a *crashed* consumer are
/// redelivered when a consumer with the same name rejoins; automatic
/// reclaim of another consumer's pending messages is not implemented.
#[async_trait]
pub trait StreamSubscriber: Send + Sync {
    /// Join `group` on `topic` as `consumer` and deliver messages to
    /// `handler`, acknowledging each one the handler processes successfully.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that the traits are object-safe
    #[allow(dead_code)]
    fn assert_publisher_object_safe(_: &dyn StreamPublisher) {}

    #[allow(dead_code)]
    fn assert_subscriber_object_safe(_: &dyn StreamSubscriber) {}

    #[allow(dead_code)]
    fn assert_handler_object_safe(_: &dyn MessageHandler) {}

    #[test]
    fn message_builder_populates_fields() {
        let msg = Message::new("problem.created", EventId::from_string("evt-1"), b"{}".to_vec())
            .with_key("prob-9")
            .with_metadata(META_AGGREGATE_ID, "prob-9")
            .with_metadata(META_AGGREGATE_TYPE, "Problem");

        assert_eq!(msg.topic, "problem.created");
        assert_eq!(msg.key.as_deref(), Some("prob-9"));
        assert_eq!(msg.aggregate_id(), Some("prob-9"));
        assert_eq!(msg.aggregate_type(), Some("Problem"));
        assert!(msg.published_at.is_none());
    }

    #[test]
    fn metadata_is_distinct_from_core_fields() {
        let msg = Message::new("t", EventId::from_string("evt-2"), vec![1, 2, 3])
            .with_metadata("id", "shadow")
            .with_metadata("payload", "shadow");

        // Metadata keys that collide with core field names stay metadata.
        assert_eq!(msg.id.as_str(), "evt-2");
        assert_eq!(msg.payload, vec![1, 2, 3]);
        assert_eq!(msg.metadata.get("id").map(String::as_str), Some("shadow"));
    }
}
