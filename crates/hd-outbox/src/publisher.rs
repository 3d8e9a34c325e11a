//! Outbox publisher worker loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hd_bus::BusPublisher;
use hd_common::topics::STATUS_TOPIC;
use hd_common::OutboxEntry;

use crate::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Claims older than this are reclaimable by other workers.
    pub claim_timeout: Duration,
    pub worker_id: String,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn BusPublisher>,
    config: OutboxPublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn BusPublisher>,
        config: OutboxPublisherConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    /// Run the publish loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting outbox publisher"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_once().await {
                        error!(error = %e, "Outbox publish tick failed");
                    }
                    if let Err(e) = self.drain_status_once().await {
                        error!(error = %e, "Status outbox drain failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!(worker_id = %self.config.worker_id, "Outbox publisher shutting down");
                    break;
                }
            }
        }
    }

    /// Claim a batch, publish per topic, mark what made it.
    pub async fn process_once(&self) -> anyhow::Result<usize> {
        let claimed = self
            .store
            .claim_batch(&self.config.worker_id, self.config.batch_size, self.config.claim_timeout)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        metrics::gauge!("outbox.claimed_batch").set(claimed.len() as f64);

        // Claim order is FIFO; grouping keeps that order within each topic.
        let mut by_topic: BTreeMap<String, Vec<&OutboxEntry>> = BTreeMap::new();
        for entry in &claimed {
            by_topic.entry(entry.topic.clone()).or_default().push(entry);
        }

        let mut published_ids = Vec::new();
        let mut notification_ids = Vec::new();

        for (topic, entries) in by_topic {
            for entry in entries {
                match self
                    .bus
                    .publish(&topic, &entry.notification_id, entry.payload.as_bytes())
                    .await
                {
                    Ok(()) => {
                        published_ids.push(entry.id.clone());
                        notification_ids.push(entry.notification_id.clone());
                    }
                    Err(e) => {
                        // Row stays in processing; stale reclaim will retry it.
                        warn!(
                            outbox_id = %entry.id,
                            topic = %topic,
                            error = %e,
                            "Failed to publish outbox row"
                        );
                        metrics::counter!("outbox.publish_errors_total").increment(1);
                    }
                }
            }
        }

        let published = published_ids.len();
        self.store.mark_published(&published_ids).await?;
        metrics::counter!("outbox.published_total").increment(published as u64);

        // Informational transition only; losing it is harmless.
        if let Err(e) = self.store.mark_notifications_processing(&notification_ids).await {
            warn!(error = %e, "Failed to mark notifications processing");
        }

        debug!(claimed = claimed.len(), published = published, "Outbox batch processed");
        Ok(published)
    }

    /// Drain recovery-originated status rows onto the status topic.
    pub async fn drain_status_once(&self) -> anyhow::Result<usize> {
        let claimed = self
            .store
            .claim_status_batch(&self.config.worker_id, self.config.batch_size, self.config.claim_timeout)
            .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        let mut processed_ids = Vec::new();
        for entry in &claimed {
            match self
                .bus
                .publish(STATUS_TOPIC, &entry.notification_id, entry.payload.as_bytes())
                .await
            {
                Ok(()) => processed_ids.push(entry.id.clone()),
                Err(e) => {
                    warn!(
                        status_outbox_id = %entry.id,
                        error = %e,
                        "Failed to drain status outbox row"
                    );
                }
            }
        }

        let drained = processed_ids.len();
        self.store.mark_status_processed(&processed_ids).await?;
        metrics::counter!("outbox.status_drained_total").increment(drained as u64);

        Ok(drained)
    }
}
