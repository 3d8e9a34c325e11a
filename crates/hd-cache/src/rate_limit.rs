//! Per-channel token buckets.
//!
//! The bucket is shared by every consumer instance of a channel, so refill
//! and consume happen in one Lua script. The caller passes `now` so the
//! script stays deterministic for replication.

use async_trait::async_trait;
use tracing::debug;

use crate::{RedisCache, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Allowed,
    Exhausted,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one token from the channel's bucket. `capacity` and
    /// `refill_per_sec` come from the channel's configuration.
    async fn try_consume(
        &self,
        channel: &str,
        capacity: u32,
        refill_per_sec: f64,
        now_ms: i64,
    ) -> Result<ConsumeOutcome>;
}

const CONSUME_SCRIPT: &str = r#"
    local capacity = tonumber(ARGV[1])
    local refill_per_sec = tonumber(ARGV[2])
    local now_ms = tonumber(ARGV[3])

    local tokens = capacity
    local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_ms')
    if bucket[1] then
        local last_refill = tonumber(bucket[2])
        local elapsed_ms = math.max(0, now_ms - last_refill)
        tokens = math.min(capacity, tonumber(bucket[1]) + elapsed_ms * refill_per_sec / 1000.0)
    end

    if tokens < 1 then
        redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill_ms', now_ms)
        return 0
    end

    redis.call('HSET', KEYS[1], 'tokens', tokens - 1, 'last_refill_ms', now_ms)
    return 1
"#;

#[async_trait]
impl RateLimiter for RedisCache {
    async fn try_consume(
        &self,
        channel: &str,
        capacity: u32,
        refill_per_sec: f64,
        now_ms: i64,
    ) -> Result<ConsumeOutcome> {
        let mut conn = self.connection();

        let allowed: i32 = redis::Script::new(CONSUME_SCRIPT)
            .key(self.bucket_key(channel))
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        let outcome = if allowed == 1 {
            ConsumeOutcome::Allowed
        } else {
            debug!(channel = %channel, "Rate limit bucket exhausted");
            ConsumeOutcome::Exhausted
        };

        Ok(outcome)
    }
}
