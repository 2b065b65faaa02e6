//! Event Relay - reliable event delivery out of a relational database.
//!
//! Implements the transactional outbox pattern end to end: business code
//! records events in the same transaction as its state changes, a
//! lock-elected relay drains them onto an append-only stream bus with
//! at-least-once delivery, and consumer groups read them with ack-based
//! crash recovery.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
