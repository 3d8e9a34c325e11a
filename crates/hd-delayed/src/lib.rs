//! Delayed pipeline.
//!
//! The stager moves delayed events from the bus into the cache's ordered set
//! keyed by due time. The poller claims due members behind TTL'd locks,
//! republishes them to their target channel topic, and only then removes
//! them from the set. An event disappears from the set strictly after its
//! publish succeeded (or after dead-letter escalation); crashes between
//! claim and confirm are repaired by lock expiry.

pub mod poller;
pub mod stager;

use thiserror::Error;

pub use poller::{DelayedPoller, DelayedPollerConfig};
pub use stager::DelayedStager;

#[derive(Error, Debug)]
pub enum DelayedError {
    #[error("Cache error: {0}")]
    Cache(#[from] hd_cache::CacheError),

    #[error("Bus error: {0}")]
    Bus(#[from] hd_bus::BusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
