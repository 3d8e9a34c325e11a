//! Retry backoff.

use std::time::Duration;

/// Exponential backoff with a cap: `min(base × 2^retry_count, cap)` ms.
pub fn backoff_delay(retry_count: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(retry_count.min(32));
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}
