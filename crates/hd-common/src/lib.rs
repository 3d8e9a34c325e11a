use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod logging;
pub mod topics;

// ============================================================================
// Notification
// ============================================================================

/// Lifecycle state of a notification.
///
/// Transitions are monotone (pending → processing → delivered|failed) with two
/// sanctioned exceptions: failed → pending via admin retry, and
/// processing → pending via orphan recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Delivered | NotificationStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical record of one delivery attempt on one channel.
///
/// Created by the ingest gate with status `pending`; mutated only by the
/// status consumer (terminal states), the recovery cron, and admin retry.
/// Never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id")]
    pub id: String,
    pub request_id: String,
    pub client_id: String,
    pub channel: String,
    /// Channel-specific recipient fields; always includes `user_id`.
    pub recipient: HashMap<String, serde_json::Value>,
    /// Channel-keyed content map.
    pub content: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub status: NotificationStatus,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
        }
    }
}

/// Transactional bridge between the store and the bus.
///
/// Inserted in the same transaction as its notification; progressed by the
/// outbox publisher; published rows are purged after a retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub notification_id: String,
    pub topic: String,
    /// Serialized bus message, published as-is.
    pub payload: String,
    pub status: OutboxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(notification_id: &str, topic: &str, payload: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.to_string(),
            topic: topic.to_string(),
            payload,
            status: OutboxStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Terminal status carried by the status pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Delivered,
    Failed,
}

impl TerminalStatus {
    pub fn as_notification_status(&self) -> NotificationStatus {
        match self {
            TerminalStatus::Delivered => NotificationStatus::Delivered,
            TerminalStatus::Failed => NotificationStatus::Failed,
        }
    }
}

/// Transactional bridge for recovery-originated status updates.
///
/// The recovery cron writes these inside its heal transaction; the outbox
/// publisher drains them onto the status topic and marks them processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusOutboxEntry {
    #[serde(rename = "_id")]
    pub id: String,
    pub notification_id: String,
    pub target_status: TerminalStatus,
    /// Serialized status message, published as-is.
    pub payload: String,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl StatusOutboxEntry {
    pub fn new(notification_id: &str, target_status: TerminalStatus, payload: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.to_string(),
            target_status,
            payload,
            processed: false,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    GhostDelivery,
    StuckProcessing,
    OrphanedPending,
    RecoveryError,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::GhostDelivery => "ghost_delivery",
            AlertKind::StuckProcessing => "stuck_processing",
            AlertKind::OrphanedPending => "orphaned_pending",
            AlertKind::RecoveryError => "recovery_error",
        }
    }
}

/// Open incident requiring operator attention. Unique on
/// (notification_id, kind); repeated detections refresh the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "_id")]
    pub id: String,
    pub notification_id: String,
    pub kind: AlertKind,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<String>,
    pub store_status: String,
    pub retry_count: u32,
    pub resolved: bool,
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime_optional"
    )]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Bus message formats
// ============================================================================

/// Payload carried on a channel topic; one message per delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub notification_id: String,
    pub request_id: String,
    pub client_id: String,
    pub channel: String,
    pub recipient: HashMap<String, serde_json::Value>,
    pub content: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl ChannelMessage {
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            notification_id: n.id.clone(),
            request_id: n.request_id.clone(),
            client_id: n.client_id.clone(),
            channel: n.channel.clone(),
            recipient: n.recipient.clone(),
            content: n.content.clone(),
            variables: n.variables.clone(),
            webhook_url: n.webhook_url.clone(),
            retry_count: n.retry_count,
            created_at: n.created_at,
            provider: n.provider.clone(),
        }
    }
}

/// Payload carried on the delayed topic and stored in the delayed ordered set.
///
/// `scheduled_at` is the due instant in epoch milliseconds; it doubles as the
/// ordered-set score. `target_topic` names the channel topic to republish to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedMessage {
    #[serde(flatten)]
    pub message: ChannelMessage,
    pub target_topic: String,
    pub scheduled_at: i64,
    #[serde(default)]
    pub poller_retries: u32,
}

/// Terminal status event. The status topic is the single serialization point
/// for "this notification reached a terminal state".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub notification_id: String,
    pub request_id: String,
    pub client_id: String,
    pub channel: String,
    pub status: TerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

// ============================================================================
// Worker identity
// ============================================================================

/// Stable identity for a worker instance, used to stamp CAS claims so stale
/// detection is meaningful. hostname:pid is unique enough per deployment.
pub fn worker_identity() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", hostname, std::process::id())
}
