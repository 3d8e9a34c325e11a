//! Outbox store trait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use hd_common::{OutboxEntry, StatusOutboxEntry};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` rows FIFO by creation instant. Eligible rows are
    /// `pending`, or `processing` with a claim older than `stale_after`.
    /// The claim must be atomic per row (compare-and-set semantics).
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<OutboxEntry>>;

    /// Mark successfully published rows.
    async fn mark_published(&self, ids: &[String]) -> Result<()>;

    /// Informational pending→processing transition on the notifications
    /// themselves; best-effort.
    async fn mark_notifications_processing(&self, notification_ids: &[String]) -> Result<()>;

    /// Claim unprocessed status-outbox rows (same CAS + stale-reclaim rules).
    async fn claim_status_batch(
        &self,
        worker_id: &str,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<StatusOutboxEntry>>;

    /// Mark drained status-outbox rows as processed.
    async fn mark_status_processed(&self, ids: &[String]) -> Result<()>;
}
