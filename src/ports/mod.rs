//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the relay core and the outside world. Adapters implement these ports.
//!
//! ## Outbox Ports
//!
//! - `OutboxStore` - Transactional event persistence for guaranteed delivery
//!
//! ## Stream Ports
//!
//! - `StreamPublisher` - Append-only log writer
//! - `StreamSubscriber` - Consumer-group reader with acknowledgment
//! - `MessageHandler` - Handler that processes delivered messages
//!
//! ## Coordination Ports
//!
//! - `LockManager` - Distributed mutual exclusion with lease auto-renewal

mod lock;
mod outbox_store;
mod stream_bus;

pub use lock::{LockError, LockGuard, LockManager, LockManagerExt};
pub use outbox_store::{OutboxError, OutboxEvent, OutboxStatus, OutboxStore};
pub use stream_bus::{
    BusError, Message, MessageHandler, StreamPublisher, StreamSubscriber, META_AGGREGATE_ID,
    META_AGGREGATE_TYPE,
};
