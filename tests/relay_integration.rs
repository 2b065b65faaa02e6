//! Integration tests for the reliable event relay.
//!
//! These tests verify the end-to-end flow:
//! 1. Business code writes events to the outbox
//! 2. The lock-elected relay drains the outbox onto the stream bus
//! 3. A consumer group reads, deduplicates, and acknowledges messages
//! 4. Events are marked as published in the outbox
//!
//! Uses in-memory implementations to test the pattern without external
//! dependencies.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use event_relay::adapters::{InMemoryLockManager, InMemoryOutboxStore, InMemoryStreamBus};
use event_relay::application::{RelayProcessor, RelayProcessorConfig, RelaySupervisor};
use event_relay::domain::foundation::EventId;
use event_relay::ports::{
    BusError, Message, MessageHandler, OutboxEvent, OutboxStatus, OutboxStore, StreamPublisher,
    StreamSubscriber,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Idempotent handler that records each distinct event id once and counts
/// raw deliveries separately, so at-least-once redelivery is observable.
struct DedupHandler {
    processed: Mutex<HashSet<String>>,
    deliveries: AtomicUsize,
    fail_first: AtomicUsize,
}

impl DedupHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            processed: Mutex::new(HashSet::new()),
            deliveries: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(0),
        })
    }

    fn failing_first(n: usize) -> Arc<Self> {
        let handler = Self::new();
        handler.fail_first.store(n, Ordering::SeqCst);
        handler
    }

    fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    fn delivery_count(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for DedupHandler {
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Handler("induced crash".into()));
        }

        self.processed
            .lock()
            .unwrap()
            .insert(message.id.as_str().to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dedup"
    }
}

fn order_event(id: &str) -> OutboxEvent {
    OutboxEvent::new("order.placed", "order-1", "Order", json!({"total": 42}))
        .unwrap()
        .with_event_id(EventId::from_string(id))
}

async fn run_subscriber_for(
    bus: Arc<InMemoryStreamBus>,
    consumer: &str,
    handler: Arc<dyn MessageHandler>,
    duration: Duration,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = consumer.to_string();
    let task = tokio::spawn(async move {
        bus.subscribe("order.placed", "billing", &consumer, handler, shutdown_rx)
            .await
    });

    tokio::time::sleep(duration).await;
    shutdown_tx.send(true).expect("subscriber exited early");
    task.await.unwrap().unwrap();
}

// =============================================================================
// End-to-end flow
// =============================================================================

#[tokio::test]
async fn outbox_to_consumer_end_to_end() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());

    for i in 0..3 {
        store.create(&order_event(&format!("evt-{i}"))).await.unwrap();
    }

    let relay = RelayProcessor::new(store.clone(), bus.clone());
    assert_eq!(relay.poll_once().await.unwrap(), 3);
    assert_eq!(store.count_with_status(OutboxStatus::Published), 3);

    let handler = DedupHandler::new();
    run_subscriber_for(bus.clone(), "c1", handler.clone(), Duration::from_millis(100)).await;

    assert_eq!(handler.processed_count(), 3);
    assert_eq!(bus.pending_count("order.placed", "billing"), 0);
}

#[tokio::test]
async fn batches_drain_in_creation_order() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());

    for i in 0..3 {
        let mut event = order_event(&format!("evt-{i}"));
        event.created_at = event_relay::domain::foundation::Timestamp::from_unix_secs(100 + i);
        store.create(&event).await.unwrap();
    }

    let relay = RelayProcessor::with_config(
        store.clone(),
        bus.clone(),
        RelayProcessorConfig::default().with_batch_size(2),
    );

    // First cycle drains the two oldest, second cycle the rest.
    assert_eq!(relay.poll_once().await.unwrap(), 2);
    assert_eq!(store.count_with_status(OutboxStatus::Published), 2);
    assert_eq!(
        store.get(&EventId::from_string("evt-2")).unwrap().status,
        OutboxStatus::Pending
    );

    assert_eq!(relay.poll_once().await.unwrap(), 1);
    assert_eq!(store.count_with_status(OutboxStatus::Published), 3);
}

#[tokio::test]
async fn relay_crash_between_publish_and_mark_causes_duplicate_not_loss() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());
    store.create(&order_event("evt-1")).await.unwrap();

    // Simulate a crash after the broker accepted the append but before the
    // outbox row was marked: publish directly, leave the row pending.
    let relay = RelayProcessor::new(store.clone(), bus.clone());
    bus.publish(
        &Message::new("order.placed", EventId::from_string("evt-1"), b"{}".to_vec()),
    )
    .await
    .unwrap();

    // Restarted relay drains the still-pending row: second append.
    assert_eq!(relay.poll_once().await.unwrap(), 1);
    assert_eq!(bus.log_len("order.placed"), 2);

    // An idempotent consumer collapses the duplicate.
    let handler = DedupHandler::new();
    run_subscriber_for(bus, "c1", handler.clone(), Duration::from_millis(100)).await;
    assert_eq!(handler.delivery_count(), 2);
    assert_eq!(handler.processed_count(), 1);
}

// =============================================================================
// Consumer-group recovery
// =============================================================================

#[tokio::test]
async fn unacked_messages_survive_consumer_crash() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());
    store.create(&order_event("evt-1")).await.unwrap();
    store.create(&order_event("evt-2")).await.unwrap();

    RelayProcessor::new(store, bus.clone())
        .poll_once()
        .await
        .unwrap();

    // First session: the handler "crashes" on both deliveries, leaving them
    // unacknowledged.
    let crashing = DedupHandler::failing_first(2);
    run_subscriber_for(bus.clone(), "c1", crashing.clone(), Duration::from_millis(100)).await;
    assert_eq!(crashing.processed_count(), 0);
    assert_eq!(bus.pending_count("order.placed", "billing"), 2);

    // The consumer rejoins under the same name and replays its pending
    // messages before anything new.
    let recovered = DedupHandler::new();
    run_subscriber_for(bus.clone(), "c1", recovered.clone(), Duration::from_millis(100)).await;
    assert_eq!(recovered.processed_count(), 2);
    assert_eq!(bus.pending_count("order.placed", "billing"), 0);
}

// =============================================================================
// Leadership
// =============================================================================

#[tokio::test]
async fn only_one_of_many_supervisors_drains_the_outbox() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());
    let lock = Arc::new(InMemoryLockManager::new());

    for i in 0..5 {
        store.create(&order_event(&format!("evt-{i}"))).await.unwrap();
    }

    // Three instances contend for the same lock; each message must still be
    // appended exactly once because only the leader runs.
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let processor = Arc::new(RelayProcessor::with_config(
                store.clone(),
                bus.clone(),
                RelayProcessorConfig::default().with_poll_interval(Duration::from_millis(10)),
            ));
            RelaySupervisor::new(
                lock.clone(),
                processor,
                "outbox-relay",
                Duration::from_secs(10),
                Duration::from_millis(20),
            )
            .start()
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(store.count_with_status(OutboxStatus::Published), 5);
    assert_eq!(bus.log_len("order.placed"), 5);

    for handle in handles {
        handle.shutdown().await;
    }
    assert!(!lock.is_held("outbox-relay"));
}

#[tokio::test]
async fn standby_supervisor_takes_over_after_leader_shutdown() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = Arc::new(InMemoryStreamBus::new());
    let lock = Arc::new(InMemoryLockManager::new());

    let make_supervisor = || {
        let processor = Arc::new(RelayProcessor::with_config(
            store.clone(),
            bus.clone(),
            RelayProcessorConfig::default().with_poll_interval(Duration::from_millis(10)),
        ));
        RelaySupervisor::new(
            lock.clone(),
            processor,
            "outbox-relay",
            Duration::from_secs(10),
            Duration::from_millis(20),
        )
    };

    let leader = make_supervisor().start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let standby = make_supervisor().start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Leader steps down; events written afterwards must be drained by the
    // standby once it wins the freed lock.
    leader.shutdown().await;
    store.create(&order_event("evt-after-failover")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.count_with_status(OutboxStatus::Published), 1);

    standby.shutdown().await;
}
