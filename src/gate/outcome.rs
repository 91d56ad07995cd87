//! Gate outcomes handed back to the surrounding web framework.

use serde::{Deserialize, Serialize};

use super::challenge::ChallengeVerdict;
use crate::throttle::{Decision, DecisionReason};

/// Terminal state of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateReason {
    Allowed,
    LimitExceeded,
    LockedOut,
    ServiceUnavailable,
    ChallengeRequired,
    ChallengeFailed,
    ScoreTooLow,
}

impl GateReason {
    /// HTTP status the framework should answer with.
    pub fn http_status_hint(&self) -> u16 {
        match self {
            GateReason::Allowed => 200,
            GateReason::LimitExceeded | GateReason::LockedOut => 429,
            GateReason::ChallengeRequired
            | GateReason::ChallengeFailed
            | GateReason::ScoreTooLow => 400,
            GateReason::ServiceUnavailable => 503,
        }
    }
}

impl From<DecisionReason> for GateReason {
    fn from(reason: DecisionReason) -> Self {
        match reason {
            DecisionReason::WithinLimit => GateReason::Allowed,
            DecisionReason::LimitExceeded => GateReason::LimitExceeded,
            DecisionReason::LockedOut => GateReason::LockedOut,
        }
    }
}

/// A dependency that failed and was let through under fail-open policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Degradation {
    StoreUnavailable,
    ChallengeUnreachable,
}

/// Machine-readable response body. Human copy is the application's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GateReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Everything a caller needs to allow the request or build a denial response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub allowed: bool,
    pub reason: GateReason,
    pub http_status_hint: u16,
    pub body: OutcomeBody,
    /// Engine decision, when the throttle step ran and the store answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Verifier result, when the challenge step ran and the verifier answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeVerdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<Degradation>,
}

impl GateOutcome {
    fn denied(reason: GateReason, body: OutcomeBody) -> Self {
        Self {
            allowed: false,
            reason,
            http_status_hint: reason.http_status_hint(),
            body,
            decision: None,
            challenge: None,
            degraded: Vec::new(),
        }
    }

    pub(crate) fn allowed(
        decision: Option<Decision>,
        challenge: Option<ChallengeVerdict>,
        degraded: Vec<Degradation>,
    ) -> Self {
        Self {
            allowed: true,
            reason: GateReason::Allowed,
            http_status_hint: GateReason::Allowed.http_status_hint(),
            body: OutcomeBody::default(),
            decision,
            challenge,
            degraded,
        }
    }

    /// Denial carrying a throttle decision.
    pub(crate) fn throttled(decision: Decision) -> Self {
        let reason = GateReason::from(decision.reason);
        let mut outcome = Self::denied(
            reason,
            OutcomeBody {
                error: Some(reason),
                retry_after: Some(decision.retry_after_seconds),
                score: None,
            },
        );
        outcome.decision = Some(decision);
        outcome
    }

    pub(crate) fn service_unavailable() -> Self {
        Self::denied(
            GateReason::ServiceUnavailable,
            OutcomeBody {
                error: Some(GateReason::ServiceUnavailable),
                ..OutcomeBody::default()
            },
        )
    }

    pub(crate) fn challenge_required() -> Self {
        Self::denied(
            GateReason::ChallengeRequired,
            OutcomeBody {
                error: Some(GateReason::ChallengeRequired),
                ..OutcomeBody::default()
            },
        )
    }

    pub(crate) fn challenge_rejected(reason: GateReason, verdict: ChallengeVerdict) -> Self {
        let mut outcome = Self::denied(
            reason,
            OutcomeBody {
                error: Some(reason),
                retry_after: None,
                score: verdict.score,
            },
        );
        outcome.challenge = Some(verdict);
        outcome
    }

    /// Attach earlier-stage context to an outcome produced by a later stage.
    pub(crate) fn with_context(
        mut self,
        decision: Option<Decision>,
        challenge: Option<ChallengeVerdict>,
        degraded: Vec<Degradation>,
    ) -> Self {
        self.decision = self.decision.or(decision);
        self.challenge = self.challenge.or(challenge);
        self.degraded.extend(degraded);
        self
    }

    /// Seconds the caller should wait, for rate-limit denials.
    pub fn retry_after(&self) -> Option<u64> {
        self.body.retry_after
    }

    /// JSON body for the framework to send.
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_throttled_body() {
        let outcome = GateOutcome::throttled(Decision::limit_exceeded(880));
        assert!(!outcome.allowed);
        assert_eq!(outcome.http_status_hint, 429);
        assert_eq!(
            outcome.body_json(),
            json!({ "error": "LIMIT_EXCEEDED", "retryAfter": 880 })
        );
    }

    #[test]
    fn test_score_too_low_body() {
        let outcome = GateOutcome::challenge_rejected(
            GateReason::ScoreTooLow,
            ChallengeVerdict::passed(Some(0.2)),
        );
        assert_eq!(outcome.http_status_hint, 400);
        assert_eq!(
            outcome.body_json(),
            json!({ "error": "SCORE_TOO_LOW", "score": 0.2 })
        );
    }

    #[test]
    fn test_status_hints() {
        assert_eq!(GateReason::Allowed.http_status_hint(), 200);
        assert_eq!(GateReason::LockedOut.http_status_hint(), 429);
        assert_eq!(GateReason::ChallengeRequired.http_status_hint(), 400);
        assert_eq!(GateReason::ServiceUnavailable.http_status_hint(), 503);
    }

    #[test]
    fn test_allowed_serializes_without_error() {
        let outcome = GateOutcome::allowed(
            Some(Decision::within_limit(3)),
            None,
            vec![Degradation::ChallengeUnreachable],
        );
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["allowed"], json!(true));
        assert_eq!(value["httpStatusHint"], json!(200));
        assert_eq!(value["body"], json!({}));
        assert_eq!(value["decision"]["remainingAttempts"], json!(3));
        assert_eq!(value["degraded"], json!(["CHALLENGE_UNREACHABLE"]));
    }
}
