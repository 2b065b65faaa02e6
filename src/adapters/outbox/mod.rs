//! Outbox store adapters.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
