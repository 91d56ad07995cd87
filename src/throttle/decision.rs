//! Per-request throttle decision.

use serde::{Deserialize, Serialize};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    WithinLimit,
    LimitExceeded,
    LockedOut,
}

/// Result of checking one (action, key) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining_attempts: u32,
    /// Only meaningful when the decision is a denial.
    pub retry_after_seconds: u64,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn within_limit(remaining_attempts: u32) -> Self {
        Self {
            allowed: true,
            remaining_attempts,
            retry_after_seconds: 0,
            reason: DecisionReason::WithinLimit,
        }
    }

    pub fn limit_exceeded(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            remaining_attempts: 0,
            retry_after_seconds,
            reason: DecisionReason::LimitExceeded,
        }
    }

    pub fn locked_out(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            remaining_attempts: 0,
            retry_after_seconds,
            reason: DecisionReason::LockedOut,
        }
    }
}
