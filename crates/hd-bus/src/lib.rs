//! Message bus abstraction.
//!
//! Traits for publishing and consuming keyed messages, with the Kafka
//! implementation in [`kafka`]. Consumers commit offsets manually, strictly
//! after the handler has finished; redelivery after a crash is expected and
//! must be absorbed downstream by idempotency records.

use async_trait::async_trait;

pub mod error;
pub mod kafka;

pub use error::BusError;

pub type Result<T> = std::result::Result<T, BusError>;

/// A message received from the bus, with the coordinates needed to commit it.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Trait for publishing keyed messages to a topic.
///
/// Messages with the same key land on the same partition, which is what
/// preserves per-notification ordering end to end.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publish a single message and wait for broker acknowledgement.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;

    /// Flush buffered messages; called during graceful shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Trait for consuming messages as part of a consumer group.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Receive the next message. Blocks until one is available.
    async fn next(&self) -> Result<IncomingMessage>;

    /// Commit the offset of a handled message. Must only be called after the
    /// handler has fully completed; an uncommitted message is redelivered.
    async fn commit(&self, message: &IncomingMessage) -> Result<()>;
}
