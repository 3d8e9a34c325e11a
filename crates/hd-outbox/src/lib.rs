//! Outbox publisher.
//!
//! Drains pending outbox rows onto the bus. Workers claim rows with a
//! per-row compare-and-set stamped with their identity, so replicas never
//! share a row; claims that outlive the stale threshold are reclaimable.
//! A row never reaches a terminal outcome here: publish failures leave it
//! `processing` for the stale-reclaim rule, and duplicate publishes are
//! absorbed downstream by idempotency records.

pub mod mongo;
pub mod publisher;
pub mod store;

pub use mongo::MongoOutboxStore;
pub use publisher::{OutboxPublisher, OutboxPublisherConfig};
pub use store::OutboxStore;
