//! Domain layer - foundation value objects shared across the relay.

pub mod foundation;
