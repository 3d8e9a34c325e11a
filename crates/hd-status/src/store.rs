//! Terminal-state writes to the notification store.

use anyhow::Result;
use async_trait::async_trait;
use bson::doc;
use mongodb::{Collection, Database};
use tracing::debug;

use hd_common::{Notification, TerminalStatus};

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn apply_status(
        &self,
        notification_id: &str,
        status: TerminalStatus,
        message: Option<&str>,
    ) -> Result<()>;
}

pub struct MongoStatusStore {
    db: Database,
}

impl MongoStatusStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }
}

#[async_trait]
impl StatusStore for MongoStatusStore {
    async fn apply_status(
        &self,
        notification_id: &str,
        status: TerminalStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut set = doc! {
            "status": status.as_notification_status().as_str(),
            "updated_at": bson::DateTime::now(),
        };
        if let Some(message) = message {
            set.insert("last_error", message);
        }

        let filter = doc! { "_id": notification_id };
        let result = self
            .notifications()
            .update_one(filter, doc! { "$set": set })
            .await?;

        debug!(
            notification_id = %notification_id,
            status = ?status,
            matched = result.matched_count,
            "Applied terminal status"
        );
        Ok(())
    }
}
