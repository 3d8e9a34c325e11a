//! MongoDB outbox store.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bson::doc;
use chrono::Utc;
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};
use tracing::debug;

use hd_common::{NotificationStatus, OutboxEntry, OutboxStatus, StatusOutboxEntry};

use crate::store::OutboxStore;

pub struct MongoOutboxStore {
    db: Database,
}

impl MongoOutboxStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn outbox(&self) -> Collection<OutboxEntry> {
        self.db.collection("outbox")
    }

    fn status_outbox(&self) -> Collection<StatusOutboxEntry> {
        self.db.collection("status_outbox")
    }

    fn notifications(&self) -> Collection<bson::Document> {
        self.db.collection("notifications")
    }
}

#[async_trait]
impl OutboxStore for MongoOutboxStore {
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEntry>> {
        let cutoff = bson::DateTime::from_chrono(
            Utc::now() - chrono::Duration::milliseconds(stale_after.as_millis() as i64),
        );
        let now = bson::DateTime::now();

        let filter = doc! {
            "$or": [
                { "status": OutboxStatus::Pending.as_str() },
                {
                    "status": OutboxStatus::Processing.as_str(),
                    "claimed_at": { "$lt": cutoff },
                },
            ]
        };
        let update = doc! {
            "$set": {
                "status": OutboxStatus::Processing.as_str(),
                "claimed_by": worker_id,
                "claimed_at": now,
                "updated_at": now,
            }
        };

        // One find_one_and_update per row keeps the claim atomic: two workers
        // running the same query can never both receive the same row.
        let mut claimed = Vec::new();
        for _ in 0..limit {
            let entry = self
                .outbox()
                .find_one_and_update(filter.clone(), update.clone())
                .sort(doc! { "created_at": 1 })
                .return_document(ReturnDocument::After)
                .await?;

            match entry {
                Some(entry) => claimed.push(entry),
                None => break,
            }
        }

        if !claimed.is_empty() {
            debug!(worker_id = %worker_id, count = claimed.len(), "Claimed outbox rows");
        }
        Ok(claimed)
    }

    async fn mark_published(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let filter = doc! { "_id": { "$in": ids } };
        let update = doc! {
            "$set": {
                "status": OutboxStatus::Published.as_str(),
                "updated_at": bson::DateTime::now(),
            }
        };
        self.outbox().update_many(filter, update).await?;
        Ok(())
    }

    async fn mark_notifications_processing(&self, notification_ids: &[String]) -> Result<()> {
        if notification_ids.is_empty() {
            return Ok(());
        }

        let filter = doc! {
            "_id": { "$in": notification_ids },
            "status": NotificationStatus::Pending.as_str(),
        };
        let update = doc! {
            "$set": {
                "status": NotificationStatus::Processing.as_str(),
                "updated_at": bson::DateTime::now(),
            }
        };
        self.notifications().update_many(filter, update).await?;
        Ok(())
    }

    async fn claim_status_batch(
        &self,
        worker_id: &str,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<StatusOutboxEntry>> {
        let cutoff = bson::DateTime::from_chrono(
            Utc::now() - chrono::Duration::milliseconds(stale_after.as_millis() as i64),
        );
        let now = bson::DateTime::now();

        let filter = doc! {
            "processed": false,
            "$or": [
                { "claimed_at": null },
                { "claimed_at": { "$lt": cutoff } },
            ]
        };
        let update = doc! {
            "$set": {
                "claimed_by": worker_id,
                "claimed_at": now,
            }
        };

        let mut claimed = Vec::new();
        for _ in 0..limit {
            let entry = self
                .status_outbox()
                .find_one_and_update(filter.clone(), update.clone())
                .sort(doc! { "created_at": 1 })
                .return_document(ReturnDocument::After)
                .await?;

            match entry {
                Some(entry) => claimed.push(entry),
                None => break,
            }
        }

        Ok(claimed)
    }

    async fn mark_status_processed(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let filter = doc! { "_id": { "$in": ids } };
        let update = doc! { "$set": { "processed": true } };
        self.status_outbox().update_many(filter, update).await?;
        Ok(())
    }
}
