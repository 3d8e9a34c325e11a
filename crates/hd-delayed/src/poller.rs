//! Delayed poller: two-phase claim/confirm.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hd_bus::BusPublisher;
use hd_cache::DelayedStore;
use hd_common::topics::STATUS_TOPIC;
use hd_common::{DelayedMessage, StatusMessage, TerminalStatus};

use crate::DelayedError;

const DEAD_LETTER_REASON: &str = "dead-letter from delayed pipeline";

#[derive(Debug, Clone)]
pub struct DelayedPollerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub claim_ttl: Duration,
    pub max_poller_retries: u32,
}

/// Single-threaded per instance; safe to replicate because claims are
/// serialized by the per-member locks.
pub struct DelayedPoller {
    store: Arc<dyn DelayedStore>,
    bus: Arc<dyn BusPublisher>,
    config: DelayedPollerConfig,
}

impl DelayedPoller {
    pub fn new(
        store: Arc<dyn DelayedStore>,
        bus: Arc<dyn BusPublisher>,
        config: DelayedPollerConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting delayed poller"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now().timestamp_millis()).await {
                        error!(error = %e, "Delayed poll tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Delayed poller shutting down");
                    break;
                }
            }
        }
    }

    /// Claim due members, publish them, confirm the ones that made it.
    pub async fn poll_once(&self, now_ms: i64) -> Result<usize, DelayedError> {
        let claimed = self
            .store
            .claim_due(now_ms, self.config.batch_size, self.config.claim_ttl.as_millis() as u64)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::new();
        for member in claimed {
            let event: DelayedMessage = match serde_json::from_str(&member) {
                Ok(event) => event,
                Err(e) => {
                    // Unparseable members can never be published; drop them.
                    warn!(error = %e, "Discarding malformed delayed member");
                    metrics::counter!("delayed.poison_pills_total").increment(1);
                    self.store.discard(&member).await?;
                    continue;
                }
            };

            let payload = serde_json::to_vec(&event.message)?;
            match self
                .bus
                .publish(&event.target_topic, &event.message.notification_id, &payload)
                .await
            {
                Ok(()) => {
                    published.push(member);
                    metrics::counter!("delayed.republished_total").increment(1);
                }
                Err(e) => {
                    warn!(
                        notification_id = %event.message.notification_id,
                        target_topic = %event.target_topic,
                        poller_retries = event.poller_retries,
                        error = %e,
                        "Failed to republish delayed event"
                    );
                    self.handle_publish_failure(&member, event).await?;
                }
            }
        }

        let count = published.len();
        // The load-bearing step: members leave the set only after their
        // publish succeeded.
        self.store.confirm(&published).await?;

        debug!(published = count, "Delayed poll complete");
        Ok(count)
    }

    async fn handle_publish_failure(
        &self,
        member: &str,
        event: DelayedMessage,
    ) -> Result<(), DelayedError> {
        if event.poller_retries + 1 > self.config.max_poller_retries {
            let status = StatusMessage {
                notification_id: event.message.notification_id.clone(),
                request_id: event.message.request_id.clone(),
                client_id: event.message.client_id.clone(),
                channel: event.message.channel.clone(),
                status: TerminalStatus::Failed,
                message: Some(DEAD_LETTER_REASON.to_string()),
                retry_count: event.message.retry_count,
                webhook_url: event.message.webhook_url.clone(),
                occurred_at: Utc::now(),
            };

            match self
                .bus
                .publish(
                    STATUS_TOPIC,
                    &event.message.notification_id,
                    &serde_json::to_vec(&status)?,
                )
                .await
            {
                Ok(()) => {
                    self.store.discard(member).await?;
                    metrics::counter!("delayed.dead_lettered_total").increment(1);
                    warn!(
                        notification_id = %event.message.notification_id,
                        "Delayed event dead-lettered"
                    );
                }
                Err(e) => {
                    // Even the status topic is down; keep the member claimable.
                    error!(error = %e, "Failed to dead-letter delayed event");
                    self.store.release(member).await?;
                }
            }
        } else {
            let mut next = event;
            next.poller_retries += 1;
            let score = next.scheduled_at;
            // Replace rewrites the member and drops its lock, so it is
            // immediately re-claimable.
            self.store
                .replace(member, &serde_json::to_string(&next)?, score)
                .await?;
        }

        Ok(())
    }
}
