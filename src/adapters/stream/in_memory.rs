//! In-memory stream bus for testing.
//!
//! Mirrors the consumer-group semantics of the Redis Streams adapter:
//! per-topic append-only logs, a shared group cursor so each message goes
//! to exactly one group member, a per-group pending list for unacked
//! deliveries, and redelivery of a consumer's own pending messages when it
//! resubscribes under the same name.
//!
//! # Security Note
//!
//! This adapter is for **testing only**. It uses `.expect()` on lock
//! operations which will panic if locks are poisoned; production code uses
//! the Redis adapter.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

use crate::ports::{BusError, Message, MessageHandler, StreamPublisher, StreamSubscriber};

#[derive(Default)]
struct GroupState {
    /// Next log sequence this group has not yet claimed.
    cursor: u64,
    /// Claimed but unacknowledged deliveries, keyed by log sequence.
    pending: BTreeMap<u64, PendingEntry>,
}

struct PendingEntry {
    consumer: String,
    message: Message,
}

#[derive(Default)]
struct TopicState {
    next_seq: u64,
    entries: Vec<(u64, Message)>,
    groups: HashMap<String, GroupState>,
}

/// In-memory stream bus for testing.
///
/// # Panics
///
/// Methods may panic if the internal lock is poisoned. Acceptable for test
/// code only.
#[derive(Default)]
pub struct InMemoryStreamBus {
    topics: Mutex<HashMap<String, TopicState>>,
    appended: Notify,
}

impl InMemoryStreamBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    // === Test Helpers ===

    /// Total messages appended to `topic`.
    pub fn log_len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned")
            .get(topic)
            .map_or(0, |t| t.entries.len())
    }

    /// Unacknowledged deliveries for `group` on `topic`.
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned")
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// True once the group exists on the topic.
    pub fn has_group(&self, topic: &str, group: &str) -> bool {
        self.topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned")
            .get(topic)
            .is_some_and(|t| t.groups.contains_key(group))
    }

    /// Creates `group` on `topic` if absent; the topic is created too.
    /// Idempotent, matching the broker's create-if-missing semantics.
    pub fn ensure_group(&self, topic: &str, group: &str) {
        let mut topics = self
            .topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned");
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
    }

    /// Claims this consumer's own unacked messages at or past `from_seq`,
    /// oldest first.
    fn claim_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        from_seq: u64,
        max: usize,
    ) -> Vec<(u64, Message)> {
        let topics = self
            .topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned");
        let Some(group_state) = topics.get(topic).and_then(|t| t.groups.get(group)) else {
            return Vec::new();
        };

        group_state
            .pending
            .range(from_seq..)
            .filter(|(_, entry)| entry.consumer == consumer)
            .take(max)
            .map(|(seq, entry)| (*seq, entry.message.clone()))
            .collect()
    }

    /// Claims up to `max` new messages past the group cursor, assigning them
    /// to `consumer` in the pending list.
    fn claim_new(&self, topic: &str, group: &str, consumer: &str, max: usize) -> Vec<(u64, Message)> {
        let mut topics = self
            .topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned");
        let Some(topic_state) = topics.get_mut(topic) else {
            return Vec::new();
        };
        let cursor = topic_state
            .groups
            .get(group)
            .map_or(u64::MAX, |g| g.cursor);

        let claimed: Vec<(u64, Message)> = topic_state
            .entries
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .take(max)
            .cloned()
            .collect();

        if let Some(group_state) = topic_state.groups.get_mut(group) {
            for (seq, message) in &claimed {
                group_state.cursor = seq + 1;
                group_state.pending.insert(
                    *seq,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        message: message.clone(),
                    },
                );
            }
        }

        claimed
    }

    fn ack(&self, topic: &str, group: &str, seq: u64) {
        let mut topics = self
            .topics
            .lock()
            .expect("InMemoryStreamBus: lock poisoned");
        if let Some(group_state) = topics.get_mut(topic).and_then(|t| t.groups.get_mut(group)) {
            group_state.pending.remove(&seq);
        }
    }

    async fn deliver(
        &self,
        topic: &str,
        group: &str,
        batch: Vec<(u64, Message)>,
        handler: &Arc<dyn MessageHandler>,
    ) {
        for (seq, message) in batch {
            match handler.handle(message).await {
                Ok(()) => self.ack(topic, group, seq),
                Err(e) => {
                    tracing::warn!(
                        topic,
                        handler = handler.name(),
                        seq,
                        error = %e,
                        "handler failed; message left unacknowledged"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl StreamPublisher for InMemoryStreamBus {
    async fn publish(&self, message: &Message) -> Result<(), BusError> {
        {
            let mut topics = self
                .topics
                .lock()
                .expect("InMemoryStreamBus: lock poisoned");
            let topic_state = topics.entry(message.topic.clone()).or_default();

            let seq = topic_state.next_seq;
            topic_state.next_seq += 1;

            let mut stored = message.clone();
            stored.published_at = Some(crate::domain::foundation::Timestamp::now());
            topic_state.entries.push((seq, stored));
        }
        self.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl StreamSubscriber for InMemoryStreamBus {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BusError> {
        const BATCH: usize = 16;

        self.ensure_group(topic, group);

        // Crash recovery first: this consumer's own unacked messages. The
        // cursor advances past each batch so an entry whose handler still
        // fails is visited once, not spun on.
        let mut recovery_cursor = 0u64;
        loop {
            let own_pending = self.claim_pending(topic, group, consumer, recovery_cursor, BATCH);
            match own_pending.last() {
                Some((last_seq, _)) => recovery_cursor = last_seq + 1,
                None => break,
            }
            self.deliver(topic, group, own_pending, &handler).await;
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let batch = self.claim_new(topic, group, consumer, BATCH);
            if batch.is_empty() {
                let notified = self.appended.notified();
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = notified => {}
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
                continue;
            }

            self.deliver(topic, group, batch, &handler).await;
        }
    }
}
