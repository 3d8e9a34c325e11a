//! Transactional submit path.
//!
//! Notifications and their outbox rows commit in a single MongoDB
//! transaction: either both collections advance or neither does. Requires a
//! replica-set topology.

use std::collections::HashMap;

use chrono::Utc;
use mongodb::bson::doc;
use mongodb::options::ReturnDocument;
use mongodb::{Client, Collection, Database};
use tracing::{debug, error};
use uuid::Uuid;

use hd_common::topics;
use hd_common::{ChannelMessage, DelayedMessage, Notification, NotificationStatus, OutboxEntry};

use crate::api::{BatchSubmitRequest, SubmitRequest};
use crate::error::{is_duplicate_key, IngestError};

pub struct IngestService {
    client: Client,
    db: Database,
}

impl IngestService {
    pub fn new(client: Client, db_name: &str) -> Self {
        let db = client.database(db_name);
        Self { client, db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }

    fn outbox(&self) -> Collection<OutboxEntry> {
        self.db.collection("outbox")
    }

    pub async fn ping(&self) -> Result<(), IngestError> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    pub async fn submit_single(&self, request: SubmitRequest) -> Result<u64, IngestError> {
        let provider = request.provider.as_ref().and_then(|p| p.first()).map(String::from);

        let notifications: Vec<Notification> = request
            .channel
            .iter()
            .map(|channel| {
                build_notification(
                    &request.request_id,
                    &request.client_id,
                    channel,
                    &request.recipient.user_id,
                    &request.recipient.fields,
                    &request.content,
                    &request.variables,
                    request.webhook_url.clone(),
                    request.scheduled_at,
                    provider.clone(),
                )
            })
            .collect();

        self.persist(notifications).await
    }

    pub async fn submit_batch(&self, request: BatchSubmitRequest) -> Result<u64, IngestError> {
        let provider = request.provider.as_ref().and_then(|p| p.first()).map(String::from);

        let mut notifications = Vec::with_capacity(request.recipients.len() * request.channel.len());
        for recipient in &request.recipients {
            for channel in &request.channel {
                notifications.push(build_notification(
                    &recipient.request_id,
                    &request.client_id,
                    channel,
                    &recipient.user_id,
                    &recipient.fields,
                    &request.content,
                    &request.variables,
                    request.webhook_url.clone(),
                    request.scheduled_at,
                    provider.clone(),
                ));
            }
        }

        self.persist(notifications).await
    }

    /// Insert notifications and matching outbox rows atomically.
    async fn persist(&self, notifications: Vec<Notification>) -> Result<u64, IngestError> {
        let outbox_entries: Vec<OutboxEntry> = notifications
            .iter()
            .map(build_outbox_entry)
            .collect::<Result<_, _>>()?;

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        if let Err(e) = self
            .notifications()
            .insert_many(&notifications)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            if is_duplicate_key(&e) {
                debug!("Duplicate (request_id, channel) rejected");
                metrics::counter!("ingest.conflict_total").increment(1);
                return Err(IngestError::Duplicate(
                    "a notification for this (request_id, channel) is already in flight or delivered"
                        .to_string(),
                ));
            }
            error!(error = %e, "Failed to insert notifications");
            return Err(e.into());
        }

        if let Err(e) = self
            .outbox()
            .insert_many(&outbox_entries)
            .session(&mut session)
            .await
        {
            let _ = session.abort_transaction().await;
            error!(error = %e, "Failed to insert outbox entries");
            return Err(e.into());
        }

        session.commit_transaction().await?;

        Ok(notifications.len() as u64)
    }

    /// Admin retry contract: reset a failed notification to pending and
    /// enqueue a fresh outbox row. The partial unique index admits the reset
    /// because failed rows are exempt from it.
    pub async fn retry_failed(&self, notification_id: &str) -> Result<(), IngestError> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let filter = doc! {
            "_id": notification_id,
            "status": NotificationStatus::Failed.as_str(),
        };
        let update = doc! {
            "$set": {
                "status": NotificationStatus::Pending.as_str(),
                "retry_count": 0,
                "updated_at": bson::DateTime::now(),
            },
            "$unset": { "last_error": "" },
        };

        let notification = match self
            .notifications()
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .session(&mut session)
            .await
        {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                let _ = session.abort_transaction().await;
                return Err(IngestError::NotFound(format!(
                    "no failed notification with id {}",
                    notification_id
                )));
            }
            Err(e) => {
                let _ = session.abort_transaction().await;
                return Err(e.into());
            }
        };

        let entry = build_outbox_entry(&notification)?;
        if let Err(e) = self.outbox().insert_one(&entry).session(&mut session).await {
            let _ = session.abort_transaction().await;
            return Err(e.into());
        }

        session.commit_transaction().await?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn build_notification(
    request_id: &str,
    client_id: &str,
    channel: &str,
    user_id: &str,
    recipient_fields: &HashMap<String, serde_json::Value>,
    content: &HashMap<String, serde_json::Value>,
    variables: &HashMap<String, String>,
    webhook_url: Option<String>,
    scheduled_at: Option<chrono::DateTime<Utc>>,
    provider: Option<String>,
) -> Notification {
    let mut recipient = recipient_fields.clone();
    recipient.insert("user_id".to_string(), serde_json::Value::String(user_id.to_string()));

    let now = Utc::now();
    Notification {
        id: Uuid::new_v4().to_string(),
        request_id: request_id.to_string(),
        client_id: client_id.to_string(),
        channel: channel.to_string(),
        recipient,
        content: content.clone(),
        variables: variables.clone(),
        webhook_url,
        status: NotificationStatus::Pending,
        scheduled_at,
        retry_count: 0,
        last_error: None,
        provider,
        created_at: now,
        updated_at: now,
    }
}

/// Route a notification to its outbox topic. A future `scheduled_at` goes
/// through the delayed pipeline; anything else (including a past instant)
/// goes straight to the channel topic.
fn build_outbox_entry(notification: &Notification) -> Result<OutboxEntry, serde_json::Error> {
    let message = ChannelMessage::from_notification(notification);
    let target_topic = topics::channel_topic(&notification.channel);

    match notification.scheduled_at {
        Some(at) if at > Utc::now() => {
            let delayed = DelayedMessage {
                message,
                target_topic,
                scheduled_at: at.timestamp_millis(),
                poller_retries: 0,
            };
            Ok(OutboxEntry::new(
                &notification.id,
                topics::DELAYED_TOPIC,
                serde_json::to_string(&delayed)?,
            ))
        }
        _ => Ok(OutboxEntry::new(
            &notification.id,
            &target_topic,
            serde_json::to_string(&message)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_notification(scheduled_at: Option<chrono::DateTime<Utc>>) -> Notification {
        build_notification(
            "9b2e8b74-3c89-4d5e-9f2a-27a5c1a2b3c4",
            "7f1d6a20-1111-4222-8333-444455556666",
            "email",
            "u1",
            &HashMap::from([("email".to_string(), serde_json::json!("a@example.com"))]),
            &HashMap::from([("email".to_string(), serde_json::json!({ "subject": "S" }))]),
            &HashMap::new(),
            None,
            scheduled_at,
            None,
        )
    }

    #[test]
    fn immediate_request_routes_to_channel_topic() {
        let notification = sample_notification(None);
        let entry = build_outbox_entry(&notification).unwrap();
        assert_eq!(entry.topic, "email_notification");
        assert_eq!(entry.notification_id, notification.id);

        let message: ChannelMessage = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(message.channel, "email");
        assert_eq!(message.retry_count, 0);
    }

    #[test]
    fn future_schedule_routes_to_delayed_topic() {
        let at = Utc::now() + Duration::hours(1);
        let notification = sample_notification(Some(at));
        let entry = build_outbox_entry(&notification).unwrap();
        assert_eq!(entry.topic, topics::DELAYED_TOPIC);

        let delayed: DelayedMessage = serde_json::from_str(&entry.payload).unwrap();
        assert_eq!(delayed.target_topic, "email_notification");
        assert_eq!(delayed.scheduled_at, at.timestamp_millis());
        assert_eq!(delayed.poller_retries, 0);
    }

    #[test]
    fn past_schedule_routes_directly() {
        let at = Utc::now() - Duration::hours(1);
        let notification = sample_notification(Some(at));
        let entry = build_outbox_entry(&notification).unwrap();
        assert_eq!(entry.topic, "email_notification");
    }

    #[test]
    fn recipient_carries_user_id() {
        let notification = sample_notification(None);
        assert_eq!(notification.recipient["user_id"], "u1");
        assert_eq!(notification.recipient["email"], "a@example.com");
        assert_eq!(notification.status, NotificationStatus::Pending);
    }
}
