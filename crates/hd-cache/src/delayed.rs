//! Delayed ordered set with two-phase claim/confirm.
//!
//! Members are serialized due-events scored by their due instant (ms). A
//! claim reserves a member behind a TTL'd per-member lock without removing it
//! from the set; only a confirm (after the downstream publish succeeded)
//! removes it. A poller crash between claim and confirm heals when the lock
//! expires.

use async_trait::async_trait;
use tracing::debug;

use crate::{RedisCache, Result};

#[async_trait]
pub trait DelayedStore: Send + Sync {
    /// Insert (or overwrite) a member with the given due time. Re-arrival of
    /// an identical member is a no-op apart from the score update.
    async fn stage(&self, member: &str, score_ms: i64) -> Result<()>;

    /// Claim up to `limit` due members: each selected member gets a claim
    /// lock with `lock_ttl_ms`; members stay in the set.
    async fn claim_due(&self, now_ms: i64, limit: u32, lock_ttl_ms: u64) -> Result<Vec<String>>;

    /// Remove published members and their claim locks.
    async fn confirm(&self, members: &[String]) -> Result<()>;

    /// Release a claim lock so the member is immediately re-claimable.
    async fn release(&self, member: &str) -> Result<()>;

    /// Swap a member in place (used to bump `poller_retries`), keeping it due.
    async fn replace(&self, old_member: &str, new_member: &str, score_ms: i64) -> Result<()>;

    /// Drop a member and its lock without publishing (dead-letter escalation).
    async fn discard(&self, member: &str) -> Result<()>;
}

const CLAIM_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
    local claimed = {}
    for _, member in ipairs(due) do
        local lock = ARGV[4] .. redis.sha1hex(member)
        if redis.call('SET', lock, '1', 'NX', 'PX', tonumber(ARGV[3])) then
            table.insert(claimed, member)
        end
    end
    return claimed
"#;

const CONFIRM_SCRIPT: &str = r#"
    local lock_prefix = ARGV[1]
    for i = 2, #ARGV do
        redis.call('ZREM', KEYS[1], ARGV[i])
        redis.call('DEL', lock_prefix .. redis.sha1hex(ARGV[i]))
    end
    return #ARGV - 1
"#;

const RELEASE_SCRIPT: &str = r#"
    return redis.call('DEL', ARGV[1] .. redis.sha1hex(ARGV[2]))
"#;

const REPLACE_SCRIPT: &str = r#"
    redis.call('ZREM', KEYS[1], ARGV[2])
    redis.call('DEL', ARGV[1] .. redis.sha1hex(ARGV[2]))
    redis.call('ZADD', KEYS[1], tonumber(ARGV[4]), ARGV[3])
    return 1
"#;

const DISCARD_SCRIPT: &str = r#"
    redis.call('ZREM', KEYS[1], ARGV[2])
    redis.call('DEL', ARGV[1] .. redis.sha1hex(ARGV[2]))
    return 1
"#;

#[async_trait]
impl DelayedStore for RedisCache {
    async fn stage(&self, member: &str, score_ms: i64) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("ZADD")
            .arg(self.delayed_key())
            .arg(score_ms)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_due(&self, now_ms: i64, limit: u32, lock_ttl_ms: u64) -> Result<Vec<String>> {
        let mut conn = self.connection();

        let claimed: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.delayed_key())
            .arg(now_ms)
            .arg(limit)
            .arg(lock_ttl_ms)
            .arg(self.claim_prefix())
            .invoke_async(&mut conn)
            .await?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed due delayed events");
        }
        Ok(claimed)
    }

    async fn confirm(&self, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection();
        let script = redis::Script::new(CONFIRM_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(self.delayed_key());
        invocation.arg(self.claim_prefix());
        for member in members {
            invocation.arg(member);
        }
        invocation.invoke_async::<i64>(&mut conn).await?;

        debug!(count = members.len(), "Confirmed published delayed events");
        Ok(())
    }

    async fn release(&self, member: &str) -> Result<()> {
        let mut conn = self.connection();
        redis::Script::new(RELEASE_SCRIPT)
            .arg(self.claim_prefix())
            .arg(member)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn replace(&self, old_member: &str, new_member: &str, score_ms: i64) -> Result<()> {
        let mut conn = self.connection();
        redis::Script::new(REPLACE_SCRIPT)
            .key(self.delayed_key())
            .arg(self.claim_prefix())
            .arg(old_member)
            .arg(new_member)
            .arg(score_ms)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn discard(&self, member: &str) -> Result<()> {
        let mut conn = self.connection();
        redis::Script::new(DISCARD_SCRIPT)
            .key(self.delayed_key())
            .arg(self.claim_prefix())
            .arg(member)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }
}
