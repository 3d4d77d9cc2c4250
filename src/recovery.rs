//! Failure recovery policy for a single failed task.
//!
//! Ported from the original orchestrator's `_handle_task_failure` /
//! `_apply_recovery_action` pair: a pure decision function plus the
//! exponential backoff calculation, kept separate from the executor so the
//! policy can be tested without spinning up agents.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Reassign,
    Skip,
    Abort,
}

/// `min(2^retry_count, 60)` seconds, exactly as the system this was ported
/// from computes its retry backoff.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Decides what to do after a task has failed.
///
/// - `RETRY` while `retry_count < MAX_RETRIES`.
/// - `REASSIGN` once retries are exhausted, if another idle instance exists
///   in the task's pool.
/// - `ABORT` otherwise, which the caller is expected to pair with a
///   critical-failure notification carrying `skip_task` / `abort_workflow`
///   / `manual_intervention` as remediation options.
pub fn decide_recovery(retry_count: u32, idle_instances_available: bool) -> RecoveryAction {
    if retry_count < MAX_RETRIES {
        RecoveryAction::Retry
    } else if idle_instances_available {
        RecoveryAction::Reassign
    } else {
        RecoveryAction::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn retries_before_reassign_before_abort() {
        assert_eq!(decide_recovery(0, true), RecoveryAction::Retry);
        assert_eq!(decide_recovery(2, true), RecoveryAction::Retry);
        assert_eq!(decide_recovery(3, true), RecoveryAction::Reassign);
        assert_eq!(decide_recovery(3, false), RecoveryAction::Abort);
    }
}
