//! Kafka implementations of the bus traits.
//!
//! The producer runs with idempotence enabled and `acks=all` so a broker
//! acknowledgement means the message is durable. Consumers disable
//! auto-commit; offsets move only through [`KafkaBusConsumer::commit`].

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::{BusConsumer, BusError, BusPublisher, IncomingMessage, Result};

/// Kafka publisher backed by an idempotent `FutureProducer`.
pub struct KafkaBusPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaBusPublisher {
    pub fn new(brokers: &str, delivery_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .create()?;

        Ok(Self {
            producer,
            delivery_timeout,
        })
    }
}

#[async_trait]
impl BusPublisher for KafkaBusPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| BusError::Kafka(err))?;

        debug!(topic = %topic, key = %key, "Published message");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.producer.flush(self.delivery_timeout)?;
        Ok(())
    }
}

/// Kafka consumer joined to a consumer group with manual offset commits.
pub struct KafkaBusConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

impl KafkaBusConsumer {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topics: &[&str],
        session_timeout_ms: u64,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", session_timeout_ms.to_string())
            .create()?;

        consumer.subscribe(topics)?;

        info!(group_id = %group_id, ?topics, "Kafka consumer subscribed");

        Ok(Self {
            consumer,
            group_id: group_id.to_string(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn next(&self) -> Result<IncomingMessage> {
        let message = self.consumer.recv().await?;

        Ok(IncomingMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&self, message: &IncomingMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;

        // Sync so the handler's effects are never ahead of the committed offset.
        self.consumer.commit(&offsets, CommitMode::Sync)?;

        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Committed offset"
        );
        Ok(())
    }
}
