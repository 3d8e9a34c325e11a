//! Reconciliation decision table.
//!
//! The cache idempotency record is the source of truth for whether the
//! provider side effect happened; the table below maps it against the
//! store's stuck `processing` row. Ambiguous combinations raise alerts and
//! are never auto-healed, because healing them wrongly risks a double send.

use hd_cache::IdempotencyStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Ghost delivery: the send happened, the store missed the transition.
    HealDelivered,
    /// The send failed and retries are exhausted; finalize as failed.
    HealFailed,
    /// Ambiguous or retryable state; raise a stuck_processing alert.
    Alert,
}

pub fn decide(
    cache_status: Option<IdempotencyStatus>,
    retry_count: u32,
    max_retry_count: u32,
) -> RecoveryAction {
    match cache_status {
        Some(IdempotencyStatus::Delivered) => RecoveryAction::HealDelivered,
        Some(IdempotencyStatus::Failed) if retry_count >= max_retry_count => {
            RecoveryAction::HealFailed
        }
        // A failed record with retries left means a retry is a manual call.
        Some(IdempotencyStatus::Failed) => RecoveryAction::Alert,
        // Processing or absent: the send may or may not have happened.
        Some(IdempotencyStatus::Processing) | None => RecoveryAction::Alert,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_cache_record_heals_to_delivered() {
        assert_eq!(
            decide(Some(IdempotencyStatus::Delivered), 0, 5),
            RecoveryAction::HealDelivered
        );
        // Even with retries left: the side effect happened.
        assert_eq!(
            decide(Some(IdempotencyStatus::Delivered), 2, 5),
            RecoveryAction::HealDelivered
        );
    }

    #[test]
    fn exhausted_failed_record_heals_to_failed() {
        assert_eq!(
            decide(Some(IdempotencyStatus::Failed), 5, 5),
            RecoveryAction::HealFailed
        );
        assert_eq!(
            decide(Some(IdempotencyStatus::Failed), 7, 5),
            RecoveryAction::HealFailed
        );
    }

    #[test]
    fn failed_with_retries_left_is_a_manual_decision() {
        assert_eq!(
            decide(Some(IdempotencyStatus::Failed), 4, 5),
            RecoveryAction::Alert
        );
    }

    #[test]
    fn ambiguous_states_never_auto_heal() {
        assert_eq!(
            decide(Some(IdempotencyStatus::Processing), 0, 5),
            RecoveryAction::Alert
        );
        assert_eq!(decide(None, 5, 5), RecoveryAction::Alert);
    }
}
