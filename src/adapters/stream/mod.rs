//! Stream bus adapters.

mod in_memory;
mod redis;

pub use in_memory::InMemoryStreamBus;
pub use redis::RedisStreamBus;
