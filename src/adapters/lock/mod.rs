//! Lock manager adapters.

mod in_memory;
mod redis;

pub use in_memory::InMemoryLockManager;
pub use redis::RedisLockManager;
