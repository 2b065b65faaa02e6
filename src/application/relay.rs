//! RelayProcessor - Background service for reliable event delivery.
//!
//! Second half of the transactional outbox pattern:
//! 1. Business code writes events to the outbox (same transaction as domain changes)
//! 2. **RelayProcessor drains the outbox and appends to the stream bus** ← This module
//!
//! Delivery is at-least-once: an event is marked published only after the
//! broker acknowledges the append, so a crash between the two can replay
//! the event but never lose it. Consumers deduplicate on `event_id`.
//!
//! ## Graceful Shutdown
//!
//! The service listens for a shutdown signal and completes the current
//! batch before stopping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time;

use crate::ports::{
    Message, OutboxError, OutboxEvent, OutboxStore, StreamPublisher, META_AGGREGATE_ID,
    META_AGGREGATE_TYPE,
};

/// Configuration for the RelayProcessor service.
#[derive(Debug, Clone)]
pub struct RelayProcessorConfig {
    /// Fallback poll interval between drain cycles. Writers normally wake
    /// the relay through its [`RelayNotifier`] well before this elapses.
    pub poll_interval: Duration,

    /// Maximum events to process per drain cycle.
    pub batch_size: u32,

    /// Publish attempts per event before it is marked terminally failed.
    pub max_retries: u32,
}

impl Default for RelayProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 100,
            max_retries: 3,
        }
    }
}

impl RelayProcessorConfig {
    /// Create config with custom poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Create config with custom batch size.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Create config with custom retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Wakes the relay immediately after an outbox write, instead of waiting
/// for the next poll tick. Cheap to clone; hand one to every writer.
#[derive(Clone, Default)]
pub struct RelayNotifier {
    inner: Arc<Notify>,
}

impl RelayNotifier {
    /// Creates a notifier not yet attached to a processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that new outbox rows may be pending.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    async fn notified(&self) {
        self.inner.notified().await;
    }
}

/// Background service that drains the outbox onto the stream bus.
pub struct RelayProcessor {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn StreamPublisher>,
    notifier: RelayNotifier,
    config: RelayProcessorConfig,
}

impl RelayProcessor {
    /// Create a new RelayProcessor with default configuration.
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn StreamPublisher>) -> Self {
        Self::with_config(store, bus, RelayProcessorConfig::default())
    }

    /// Create a new RelayProcessor with custom configuration.
    pub fn with_config(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn StreamPublisher>,
        config: RelayProcessorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            notifier: RelayNotifier::new(),
            config,
        }
    }

    /// Notifier that wakes this processor's drain loop.
    pub fn notifier(&self) -> RelayNotifier {
        self.notifier.clone()
    }

    /// Run the drain loop until shutdown signal is received.
    ///
    /// Transient infrastructure failures (database or broker down) are
    /// logged and retried on the next cycle rather than terminating the
    /// loop; per-event publish failures are recorded on the event itself.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Shutdown requested - finish one final batch then exit
                        self.drain_logged().await;
                        return;
                    }
                }

                _ = self.notifier.notified() => {
                    self.drain_logged().await;
                }

                _ = interval.tick() => {
                    self.drain_logged().await;
                }
            }
        }
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.process_batch().await {
            tracing::error!(error = %e, "relay drain cycle failed; will retry");
        }
    }

    /// Process a single batch of pending events.
    ///
    /// Returns the number of events successfully published. Also useful for
    /// testing without running the full loop.
    pub async fn process_batch(&self) -> Result<usize, OutboxError> {
        let events = self
            .store
            .get_pending(self.config.batch_size, self.config.max_retries)
            .await?;
        let mut published_count = 0;

        for event in events {
            let message = match to_message(&event) {
                Ok(message) => message,
                Err(e) => {
                    // Unserializable payloads never succeed on retry, but
                    // the retry budget caps them at `failed` all the same.
                    self.store
                        .mark_failed(&event.event_id, &e, self.config.max_retries)
                        .await?;
                    continue;
                }
            };

            match self.bus.publish(&message).await {
                Ok(()) => {
                    self.store.mark_published(&event.event_id).await?;
                    published_count += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        event_type = %event.event_type,
                        error = %e,
                        "failed to publish event"
                    );
                    self.store
                        .mark_failed(&event.event_id, &e.to_string(), self.config.max_retries)
                        .await?;
                }
            }
        }

        Ok(published_count)
    }

    /// Run exactly one drain cycle (for testing).
    pub async fn poll_once(&self) -> Result<usize, OutboxError> {
        self.process_batch().await
    }
}

fn to_message(event: &OutboxEvent) -> Result<Message, String> {
    let payload = serde_json::to_vec(&event.payload)
        .map_err(|e| format!("payload serialization failed: {}", e))?;

    Ok(
        Message::new(&event.event_type, event.event_id.clone(), payload)
            .with_key(&event.aggregate_id)
            .with_metadata(META_AGGREGATE_ID, &event.aggregate_id)
            .with_metadata(META_AGGREGATE_TYPE, &event.aggregate_type)
            .with_occurred_at(event.created_at),
    )
}
