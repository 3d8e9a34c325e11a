//! Channel consumer.
//!
//! One deployment per channel. Consumes the channel topic, enforces
//! idempotency and rate limits through the cache, invokes the channel's
//! `Provider`, and pronounces the outcome on the status or delayed topic.
//! Offsets commit only after the handler finishes; every exception path ends
//! in exactly one of: commit-and-drop, publish-delayed-and-commit,
//! publish-failed-and-commit, or leave-uncommitted-for-redelivery.

pub mod backoff;
pub mod provider;
pub mod registry;
pub mod worker;

use thiserror::Error;

pub use backoff::backoff_delay;
pub use provider::{HttpProvider, Provider, SendError};
pub use registry::{ChannelEntry, ChannelRegistry};
pub use worker::{DispatchWorker, DispatchWorkerConfig};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Cache error: {0}")]
    Cache(#[from] hd_cache::CacheError),

    #[error("Bus error: {0}")]
    Bus(#[from] hd_bus::BusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
