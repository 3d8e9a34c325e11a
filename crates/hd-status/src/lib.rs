//! Status pipeline.
//!
//! The status topic is the single serialization point for "this notification
//! reached terminal state": channel consumers, the delayed poller's
//! dead-letter path, and the recovery cron all publish here, and the store
//! is updated from this one place. After the store update, the client
//! webhook fires with bounded retries; webhook failure never rolls back the
//! store commit.

pub mod consumer;
pub mod store;
pub mod webhook;

use thiserror::Error;

pub use consumer::StatusWorker;
pub use store::{MongoStatusStore, StatusStore};
pub use webhook::{WebhookDispatcher, WebhookOutcome, WebhookPayload, WebhookSettings};

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Bus error: {0}")]
    Bus(#[from] hd_bus::BusError),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
