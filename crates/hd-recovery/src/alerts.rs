//! Alert repository.
//!
//! Alerts are unique on (notification_id, kind): repeated detections refresh
//! the existing row instead of duplicating it.

use anyhow::Result;
use bson::doc;
use chrono::{DateTime, Utc};
use mongodb::{Collection, Database};
use tracing::info;
use uuid::Uuid;

use hd_common::{Alert, AlertKind};

pub struct AlertRepository {
    db: Database,
}

impl AlertRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn alerts(&self) -> Collection<Alert> {
        self.db.collection("alerts")
    }

    pub async fn upsert(
        &self,
        notification_id: &str,
        kind: AlertKind,
        reason: &str,
        cache_status: Option<&str>,
        store_status: &str,
        retry_count: u32,
    ) -> Result<()> {
        let filter = doc! {
            "notification_id": notification_id,
            "kind": kind.as_str(),
        };
        let update = doc! {
            "$set": {
                "reason": reason,
                "cache_status": cache_status,
                "store_status": store_status,
                "retry_count": retry_count,
                "updated_at": bson::DateTime::now(),
            },
            "$setOnInsert": {
                "_id": Uuid::new_v4().to_string(),
                "resolved": false,
                "created_at": bson::DateTime::now(),
            },
        };

        let result = self.alerts().update_one(filter, update).upsert(true).await?;
        if result.upserted_id.is_some() {
            info!(
                notification_id = %notification_id,
                kind = kind.as_str(),
                reason = %reason,
                "Raised alert"
            );
            metrics::counter!("recovery.alerts_raised_total", "kind" => kind.as_str())
                .increment(1);
        }
        Ok(())
    }

    pub async fn resolve(&self, notification_id: &str, kind: AlertKind) -> Result<()> {
        let filter = doc! {
            "notification_id": notification_id,
            "kind": kind.as_str(),
            "resolved": false,
        };
        let update = doc! {
            "$set": {
                "resolved": true,
                "resolved_at": bson::DateTime::now(),
                "updated_at": bson::DateTime::now(),
            },
        };
        self.alerts().update_many(filter, update).await?;
        Ok(())
    }

    /// Delete resolved alerts older than the retention cutoff.
    pub async fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let filter = doc! {
            "resolved": true,
            "resolved_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
        };
        let result = self.alerts().delete_many(filter).await?;
        Ok(result.deleted_count)
    }
}
