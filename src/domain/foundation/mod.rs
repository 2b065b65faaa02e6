//! Foundation types shared by every layer of the relay.
//!
//! - `EventId` - Unique identifier for events (deduplication)
//! - `Timestamp` - Immutable UTC point in time

mod events;
mod timestamp;

pub use events::EventId;
pub use timestamp::Timestamp;
