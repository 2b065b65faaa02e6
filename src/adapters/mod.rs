//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the relay core to external systems:
//! - `outbox` - Outbox store (PostgreSQL, in-memory for tests)
//! - `stream` - Stream bus (Redis Streams, in-memory for tests)
//! - `lock` - Distributed lock (Redis, in-memory for tests)

pub mod lock;
pub mod outbox;
pub mod stream;

pub use lock::{InMemoryLockManager, RedisLockManager};
pub use outbox::{InMemoryOutboxStore, PostgresOutboxStore};
pub use stream::{InMemoryStreamBus, RedisStreamBus};
