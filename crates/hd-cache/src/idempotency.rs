//! Idempotency records.
//!
//! The record keyed by notification id is the cache's source of truth for
//! whether the provider side effect has already happened. It outlives the
//! store's pending/processing states: a `delivered` record with no matching
//! store transition is exactly what the recovery cron calls a ghost delivery.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{CacheError, RedisCache, Result};

/// Outcome of the atomic processing-lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// No record existed; this is the first attempt.
    FirstAttempt,
    /// A `failed` record existed; this attempt is a retry.
    Retry,
    /// Another worker holds the processing lock.
    InFlight,
    /// The side effect already happened; skip.
    AlreadyDelivered,
}

impl AcquireOutcome {
    pub fn lock_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::FirstAttempt | AcquireOutcome::Retry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Processing,
    Delivered,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Delivered => "delivered",
            IdempotencyStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(IdempotencyStatus::Processing),
            "delivered" => Some(IdempotencyStatus::Delivered),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically inspect the record and acquire the processing lock when the
    /// state admits an attempt. The `processing` record is written with its
    /// TTL in the same round trip; there is no check-then-set window.
    async fn acquire_processing(
        &self,
        notification_id: &str,
        processing_ttl: Duration,
    ) -> Result<AcquireOutcome>;

    async fn mark_delivered(&self, notification_id: &str, ttl: Duration) -> Result<()>;

    async fn mark_failed(&self, notification_id: &str, ttl: Duration) -> Result<()>;

    /// Read the current record, if any. Used by the recovery cron.
    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyStatus>>;
}

const ACQUIRE_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if not current then
        redis.call('SET', KEYS[1], 'processing', 'EX', tonumber(ARGV[1]))
        return 'first'
    end
    if current == 'processing' then
        return 'in_flight'
    end
    if current == 'delivered' then
        return 'delivered'
    end
    redis.call('SET', KEYS[1], 'processing', 'EX', tonumber(ARGV[1]))
    return 'retry'
"#;

#[async_trait]
impl IdempotencyStore for RedisCache {
    async fn acquire_processing(
        &self,
        notification_id: &str,
        processing_ttl: Duration,
    ) -> Result<AcquireOutcome> {
        let mut conn = self.connection();

        let reply: String = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.idempotency_key(notification_id))
            .arg(processing_ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        let outcome = match reply.as_str() {
            "first" => AcquireOutcome::FirstAttempt,
            "retry" => AcquireOutcome::Retry,
            "in_flight" => AcquireOutcome::InFlight,
            "delivered" => AcquireOutcome::AlreadyDelivered,
            other => return Err(CacheError::Protocol(format!("acquire returned {other}"))),
        };

        debug!(notification_id = %notification_id, ?outcome, "Processing lock decision");
        Ok(outcome)
    }

    async fn mark_delivered(&self, notification_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(self.idempotency_key(notification_id))
            .arg(IdempotencyStatus::Delivered.as_str())
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, notification_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("SET")
            .arg(self.idempotency_key(notification_id))
            .arg(IdempotencyStatus::Failed.as_str())
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, notification_id: &str) -> Result<Option<IdempotencyStatus>> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.idempotency_key(notification_id))
            .query_async(&mut conn)
            .await?;

        Ok(value.as_deref().and_then(IdempotencyStatus::parse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse() {
        assert_eq!(
            IdempotencyStatus::parse("delivered"),
            Some(IdempotencyStatus::Delivered)
        );
        assert_eq!(IdempotencyStatus::parse("bogus"), None);
    }

    #[test]
    fn lock_acquired_outcomes() {
        assert!(AcquireOutcome::FirstAttempt.lock_acquired());
        assert!(AcquireOutcome::Retry.lock_acquired());
        assert!(!AcquireOutcome::InFlight.lock_acquired());
        assert!(!AcquireOutcome::AlreadyDelivered.lock_acquired());
    }
}
