//! Per-channel dispatch worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use hd_bus::{BusConsumer, BusPublisher, IncomingMessage};
use hd_cache::{ConsumeOutcome, IdempotencyStore, RateLimiter};
use hd_common::topics::{self, DELAYED_TOPIC, STATUS_TOPIC};
use hd_common::{ChannelMessage, DelayedMessage, StatusMessage, TerminalStatus};

use crate::backoff::backoff_delay;
use crate::provider::{Provider, SendError};
use crate::DispatchError;

#[derive(Debug, Clone)]
pub struct DispatchWorkerConfig {
    pub channel: String,
    pub max_retry_count: u32,
    pub processing_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub provider_timeout: Duration,
    pub rate_limit_tokens: u32,
    pub rate_limit_refill_rate: f64,
}

pub struct DispatchWorker {
    config: DispatchWorkerConfig,
    consumer: Arc<dyn BusConsumer>,
    bus: Arc<dyn BusPublisher>,
    idempotency: Arc<dyn IdempotencyStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    provider: Arc<dyn Provider>,
}

impl DispatchWorker {
    pub fn new(
        config: DispatchWorkerConfig,
        consumer: Arc<dyn BusConsumer>,
        bus: Arc<dyn BusPublisher>,
        idempotency: Arc<dyn IdempotencyStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            config,
            consumer,
            bus,
            idempotency,
            rate_limiter,
            provider,
        }
    }

    /// Consume until shutdown. Handler failures are infrastructure errors;
    /// the message stays uncommitted and the bus redelivers it.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            channel = %self.config.channel,
            provider = %self.provider.name(),
            "Starting dispatch worker"
        );

        loop {
            tokio::select! {
                received = self.consumer.next() => {
                    match received {
                        Ok(message) => {
                            if let Err(e) = self.handle_message(&message).await {
                                error!(
                                    channel = %self.config.channel,
                                    error = %e,
                                    "Handler failed; message left uncommitted for redelivery"
                                );
                                metrics::counter!("dispatch.handler_errors_total").increment(1);
                            }
                        }
                        Err(e) => {
                            error!(channel = %self.config.channel, error = %e, "Consumer receive failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(channel = %self.config.channel, "Dispatch worker shutting down");
                    break;
                }
            }
        }
    }

    pub async fn handle_message(&self, incoming: &IncomingMessage) -> Result<(), DispatchError> {
        // Parse & validate. A payload that cannot deserialize can never
        // succeed: log and drop it (poison pill).
        let message: ChannelMessage = match serde_json::from_slice(&incoming.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    topic = %incoming.topic,
                    offset = incoming.offset,
                    error = %e,
                    "Dropping malformed channel message"
                );
                metrics::counter!("dispatch.poison_pills_total").increment(1);
                self.consumer.commit(incoming).await?;
                return Ok(());
            }
        };

        // Acquire the processing lock. The cache script writes the
        // `processing` record with its TTL in the same round trip.
        let outcome = self
            .idempotency
            .acquire_processing(&message.notification_id, self.config.processing_ttl)
            .await?;

        if !outcome.lock_acquired() {
            debug!(
                notification_id = %message.notification_id,
                ?outcome,
                "Skipping message"
            );
            metrics::counter!("dispatch.skipped_total").increment(1);
            self.consumer.commit(incoming).await?;
            return Ok(());
        }

        // Rate limit. Exhaustion is a recoverable failure, deferred through
        // the delayed queue like any transient send error.
        let consume = self
            .rate_limiter
            .try_consume(
                &self.config.channel,
                self.config.rate_limit_tokens,
                self.config.rate_limit_refill_rate,
                Utc::now().timestamp_millis(),
            )
            .await?;

        if consume == ConsumeOutcome::Exhausted {
            metrics::counter!("dispatch.rate_limited_total").increment(1);
            return self.handle_failure(incoming, &message, "rate_limited").await;
        }

        // Deliver, bounded by the per-call deadline.
        let send_result = match tokio::time::timeout(
            self.config.provider_timeout,
            self.provider
                .send(&message.recipient, &message.content, &message.variables),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Retryable("provider send timed out".to_string())),
        };

        match send_result {
            Ok(()) => self.handle_success(incoming, &message).await,
            Err(e) => self.handle_failure(incoming, &message, &e.to_string()).await,
        }
    }

    /// The delivered record must be durable in the cache before the offset
    /// commits: a crash in between causes a redelivery that the record then
    /// short-circuits.
    async fn handle_success(
        &self,
        incoming: &IncomingMessage,
        message: &ChannelMessage,
    ) -> Result<(), DispatchError> {
        self.idempotency
            .mark_delivered(&message.notification_id, self.config.idempotency_ttl)
            .await?;

        let status = StatusMessage {
            notification_id: message.notification_id.clone(),
            request_id: message.request_id.clone(),
            client_id: message.client_id.clone(),
            channel: message.channel.clone(),
            status: TerminalStatus::Delivered,
            message: None,
            retry_count: message.retry_count,
            webhook_url: message.webhook_url.clone(),
            occurred_at: Utc::now(),
        };
        self.bus
            .publish(
                STATUS_TOPIC,
                &message.notification_id,
                &serde_json::to_vec(&status)?,
            )
            .await?;

        self.consumer.commit(incoming).await?;

        metrics::counter!("dispatch.delivered_total").increment(1);
        debug!(notification_id = %message.notification_id, "Delivered");
        Ok(())
    }

    async fn handle_failure(
        &self,
        incoming: &IncomingMessage,
        message: &ChannelMessage,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.idempotency
            .mark_failed(&message.notification_id, self.config.idempotency_ttl)
            .await?;

        if message.retry_count + 1 > self.config.max_retry_count {
            let status = StatusMessage {
                notification_id: message.notification_id.clone(),
                request_id: message.request_id.clone(),
                client_id: message.client_id.clone(),
                channel: message.channel.clone(),
                status: TerminalStatus::Failed,
                message: Some(reason.to_string()),
                retry_count: message.retry_count,
                webhook_url: message.webhook_url.clone(),
                occurred_at: Utc::now(),
            };
            self.bus
                .publish(
                    STATUS_TOPIC,
                    &message.notification_id,
                    &serde_json::to_vec(&status)?,
                )
                .await?;

            metrics::counter!("dispatch.failed_total").increment(1);
            warn!(
                notification_id = %message.notification_id,
                retry_count = message.retry_count,
                reason = %reason,
                "Retries exhausted; notification failed"
            );
        } else {
            let delay = backoff_delay(
                message.retry_count,
                self.config.backoff_base_ms,
                self.config.backoff_cap_ms,
            );
            let mut next = message.clone();
            next.retry_count += 1;

            let delayed = DelayedMessage {
                message: next,
                target_topic: topics::channel_topic(&self.config.channel),
                scheduled_at: Utc::now().timestamp_millis() + delay.as_millis() as i64,
                poller_retries: 0,
            };
            self.bus
                .publish(
                    DELAYED_TOPIC,
                    &message.notification_id,
                    &serde_json::to_vec(&delayed)?,
                )
                .await?;

            metrics::counter!("dispatch.retried_total").increment(1);
            debug!(
                notification_id = %message.notification_id,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Scheduled retry"
            );
        }

        self.consumer.commit(incoming).await?;
        Ok(())
    }
}
