//! Side-effect cache.
//!
//! Redis owns delivery-occurrence truth (idempotency records) and ephemeral
//! scheduling state (rate buckets, the delayed ordered set). Every multi-step
//! decision is a server-side Lua script returning a discriminated outcome, so
//! concurrent worker instances never race on check-then-set.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tracing::info;

mod delayed;
mod idempotency;
mod rate_limit;

pub use delayed::DelayedStore;
pub use idempotency::{AcquireOutcome, IdempotencyStatus, IdempotencyStore};
pub use rate_limit::{ConsumeOutcome, RateLimiter};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unexpected cache reply: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Redis-backed cache. One instance implements every cache concern; workers
/// hold it behind the trait they need.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(prefix = %prefix, "Connected to cache");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub(crate) fn idempotency_key(&self, notification_id: &str) -> String {
        format!("{}:idem:{}", self.prefix, notification_id)
    }

    pub(crate) fn bucket_key(&self, channel: &str) -> String {
        format!("{}:bucket:{}", self.prefix, channel)
    }

    pub(crate) fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    pub(crate) fn claim_prefix(&self) -> String {
        format!("{}:claim:", self.prefix)
    }

    /// Liveness probe; recovery skips its tick when this fails.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Convenience alias used by health checks across binaries.
#[async_trait]
pub trait CacheHealth: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl CacheHealth for RedisCache {
    async fn ping(&self) -> Result<()> {
        self.health_check().await
    }
}
