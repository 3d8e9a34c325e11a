use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consumer stopped")]
    Stopped,
}
