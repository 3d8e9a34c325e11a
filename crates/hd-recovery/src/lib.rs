//! Recovery cron.
//!
//! Periodically reconciles notifications stuck in non-terminal states with
//! the cache's delivery-occurrence truth. Ghost deliveries and exhausted
//! failures are healed transactionally through the status outbox; anything
//! ambiguous becomes an alert for manual triage. A tick runs only when both
//! the store and the cache answer health probes.

pub mod alerts;
pub mod decision;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bson::doc;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::{Client, Collection, Database};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use hd_cache::{CacheHealth, IdempotencyStore};
use hd_common::{
    AlertKind, Notification, NotificationStatus, OutboxStatus, StatusMessage, StatusOutboxEntry,
    TerminalStatus,
};

pub use alerts::AlertRepository;
pub use decision::{decide, RecoveryAction};

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub processing_stuck_threshold: Duration,
    pub pending_stuck_threshold: Duration,
    pub alert_retention: Duration,
    pub status_outbox_retention: Duration,
    pub outbox_retention: Duration,
    pub max_retry_count: u32,
    pub worker_id: String,
}

pub struct RecoveryService {
    client: Client,
    db: Database,
    idempotency: Arc<dyn IdempotencyStore>,
    cache_health: Arc<dyn CacheHealth>,
    alerts: AlertRepository,
    settings: RecoverySettings,
}

impl RecoveryService {
    pub fn new(
        client: Client,
        db: Database,
        idempotency: Arc<dyn IdempotencyStore>,
        cache_health: Arc<dyn CacheHealth>,
        settings: RecoverySettings,
    ) -> Self {
        let alerts = AlertRepository::new(db.clone());
        Self {
            client,
            db,
            idempotency,
            cache_health,
            alerts,
            settings,
        }
    }

    fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }

    fn status_outbox(&self) -> Collection<StatusOutboxEntry> {
        self.db.collection("status_outbox")
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker_id = %self.settings.worker_id,
            poll_interval_ms = self.settings.poll_interval.as_millis(),
            "Starting recovery cron"
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Recovery tick failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Recovery cron shutting down");
                    break;
                }
            }
        }
    }

    /// One recovery cycle: health gate, then the three passes.
    pub async fn tick(&self) -> Result<()> {
        if !self.dependencies_healthy().await {
            warn!("Store or cache unhealthy; skipping recovery tick");
            metrics::counter!("recovery.ticks_skipped_total").increment(1);
            return Ok(());
        }

        self.recover_stuck_processing().await?;
        self.flag_orphaned_pending().await?;
        self.cleanup().await?;

        metrics::counter!("recovery.ticks_total").increment(1);
        Ok(())
    }

    /// Auto-healing with a stale store view risks double sends, so a tick
    /// only runs when both substrates are reachable.
    async fn dependencies_healthy(&self) -> bool {
        if let Err(e) = self.db.run_command(doc! { "ping": 1 }).await {
            warn!(error = %e, "Store health probe failed");
            return false;
        }
        if let Err(e) = self.cache_health.ping().await {
            warn!(error = %e, "Cache health probe failed");
            return false;
        }
        true
    }

    /// Pass 1: notifications stuck in `processing` past the threshold.
    async fn recover_stuck_processing(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(
                self.settings.processing_stuck_threshold.as_millis() as i64
            );
        let filter = doc! {
            "status": NotificationStatus::Processing.as_str(),
            "updated_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
        };

        let mut cursor = self
            .notifications()
            .find(filter)
            .sort(doc! { "updated_at": 1 })
            .limit(self.settings.batch_size as i64)
            .await?;

        while let Some(notification) = cursor.try_next().await? {
            if let Err(e) = self.reconcile_one(&notification).await {
                error!(
                    notification_id = %notification.id,
                    error = %e,
                    "Failed to reconcile stuck notification"
                );
                let _ = self
                    .alerts
                    .upsert(
                        &notification.id,
                        AlertKind::RecoveryError,
                        &format!("reconciliation failed: {e}"),
                        None,
                        notification.status.as_str(),
                        notification.retry_count,
                    )
                    .await;
            }
        }

        Ok(())
    }

    async fn reconcile_one(&self, notification: &Notification) -> Result<()> {
        let cache_status = self.idempotency.get(&notification.id).await?;
        let action = decide(
            cache_status,
            notification.retry_count,
            self.settings.max_retry_count,
        );

        debug!(
            notification_id = %notification.id,
            cache_status = ?cache_status,
            retry_count = notification.retry_count,
            ?action,
            "Reconciling stuck notification"
        );

        match action {
            RecoveryAction::HealDelivered => {
                self.heal(notification, TerminalStatus::Delivered, None).await?;
                metrics::counter!("recovery.ghost_deliveries_healed_total").increment(1);
            }
            RecoveryAction::HealFailed => {
                let message = notification
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "delivery failed; retries exhausted".to_string());
                self.heal(notification, TerminalStatus::Failed, Some(message)).await?;
                metrics::counter!("recovery.failures_healed_total").increment(1);
            }
            RecoveryAction::Alert => {
                self.alerts
                    .upsert(
                        &notification.id,
                        AlertKind::StuckProcessing,
                        "notification stuck in processing; cache state does not admit auto-heal",
                        cache_status.map(|s| s.as_str()),
                        notification.status.as_str(),
                        notification.retry_count,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Heal transactionally: CAS the notification out of `processing` and
    /// insert the status-outbox row in the same transaction. The publisher
    /// drains the row onto the status topic, so the webhook still fires.
    async fn heal(
        &self,
        notification: &Notification,
        target: TerminalStatus,
        message: Option<String>,
    ) -> Result<()> {
        let status_message = StatusMessage {
            notification_id: notification.id.clone(),
            request_id: notification.request_id.clone(),
            client_id: notification.client_id.clone(),
            channel: notification.channel.clone(),
            status: target,
            message: message.clone(),
            retry_count: notification.retry_count,
            webhook_url: notification.webhook_url.clone(),
            occurred_at: Utc::now(),
        };
        let entry = StatusOutboxEntry::new(
            &notification.id,
            target,
            serde_json::to_string(&status_message)?,
        );

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let mut set = doc! {
            "status": target.as_notification_status().as_str(),
            "updated_at": bson::DateTime::now(),
        };
        if let Some(message) = &message {
            set.insert("last_error", message);
        }

        // CAS from processing: if another writer moved the row first, the
        // filter misses and the heal is a no-op.
        let filter = doc! {
            "_id": &notification.id,
            "status": NotificationStatus::Processing.as_str(),
        };

        let updated = match self
            .notifications()
            .update_one(filter, doc! { "$set": set })
            .session(&mut session)
            .await
        {
            Ok(result) => result.modified_count,
            Err(e) => {
                let _ = session.abort_transaction().await;
                return Err(e.into());
            }
        };

        if updated == 0 {
            let _ = session.abort_transaction().await;
            debug!(
                notification_id = %notification.id,
                "Notification moved on its own; skipping heal"
            );
            return Ok(());
        }

        if let Err(e) = self
            .status_outbox()
            .insert_one(&entry)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            return Err(e.into());
        }

        session.commit_transaction().await?;

        info!(
            notification_id = %notification.id,
            status = ?target,
            "Healed stuck notification"
        );
        Ok(())
    }

    /// Pass 2: notifications still `pending` past the threshold. The usual
    /// causes are a stopped publisher or outbox cleanup racing ingest, both
    /// of which need an operator.
    async fn flag_orphaned_pending(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(
                self.settings.pending_stuck_threshold.as_millis() as i64
            );
        let filter = doc! {
            "status": NotificationStatus::Pending.as_str(),
            "updated_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
        };

        let mut cursor = self
            .notifications()
            .find(filter)
            .sort(doc! { "updated_at": 1 })
            .limit(self.settings.batch_size as i64)
            .await?;

        let mut flagged = 0u64;
        while let Some(notification) = cursor.try_next().await? {
            self.alerts
                .upsert(
                    &notification.id,
                    AlertKind::OrphanedPending,
                    "notification accepted but not published within the stuck threshold",
                    None,
                    notification.status.as_str(),
                    notification.retry_count,
                )
                .await?;
            flagged += 1;
        }

        if flagged > 0 {
            warn!(count = flagged, "Flagged orphaned pending notifications");
            metrics::gauge!("recovery.orphaned_pending").set(flagged as f64);
        }
        Ok(())
    }

    /// Pass 3: retention cleanup of resolved alerts, processed status-outbox
    /// rows, and published outbox rows.
    async fn cleanup(&self) -> Result<()> {
        let now = Utc::now();

        let alert_cutoff =
            now - chrono::Duration::milliseconds(self.settings.alert_retention.as_millis() as i64);
        let deleted_alerts = self.alerts.delete_resolved_before(alert_cutoff).await?;

        let status_cutoff = now
            - chrono::Duration::milliseconds(
                self.settings.status_outbox_retention.as_millis() as i64
            );
        let deleted_status = self
            .status_outbox()
            .delete_many(doc! {
                "processed": true,
                "created_at": { "$lt": bson::DateTime::from_chrono(status_cutoff) },
            })
            .await?
            .deleted_count;

        let outbox_cutoff = now
            - chrono::Duration::milliseconds(self.settings.outbox_retention.as_millis() as i64);
        let deleted_outbox = self
            .db
            .collection::<bson::Document>("outbox")
            .delete_many(doc! {
                "status": OutboxStatus::Published.as_str(),
                "updated_at": { "$lt": bson::DateTime::from_chrono(outbox_cutoff) },
            })
            .await?
            .deleted_count;

        if deleted_alerts + deleted_status + deleted_outbox > 0 {
            debug!(
                alerts = deleted_alerts,
                status_outbox = deleted_status,
                outbox = deleted_outbox,
                "Retention cleanup complete"
            );
        }
        Ok(())
    }
}
