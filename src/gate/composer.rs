//! Gate composition: throttle plus optional challenge in front of a handler.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, trace, warn};

use super::challenge::{ChallengeVerdict, ChallengeVerifier};
use super::outcome::{Degradation, GateOutcome, GateReason};
use super::request::GateRequest;
use crate::clock::Clock;
use crate::error::{ChallengeError, ConfigError, EngineError, Result};
use crate::throttle::{Decision, ThrottleEngine, ThrottleKey};

/// Default bound on a challenge verifier round-trip.
pub const DEFAULT_CHALLENGE_TIMEOUT_MS: u64 = 3000;

/// What a gate does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreErrorPolicy {
    /// Let the request through and flag the outcome as degraded.
    #[default]
    FailOpen,
    /// Deny with `SERVICE_UNAVAILABLE`.
    FailClosed,
}

/// Order of the throttle and challenge stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckOrder {
    /// Rate-limited requests are rejected before paying for a verifier
    /// round-trip. A failed challenge still counts as an attempt.
    #[default]
    ThrottleFirst,
    /// A failed challenge never counts as an attempt.
    ChallengeFirst,
}

/// Per-gate options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOptions {
    #[serde(default)]
    pub on_store_error: StoreErrorPolicy,

    /// Verifier scores below this are rejected with `SCORE_TOO_LOW`.
    #[serde(default)]
    pub min_score: Option<f64>,

    #[serde(default)]
    pub require_challenge: bool,

    #[serde(default = "default_challenge_timeout_ms")]
    pub challenge_timeout_ms: u64,

    #[serde(default)]
    pub order: CheckOrder,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            on_store_error: StoreErrorPolicy::default(),
            min_score: None,
            require_challenge: false,
            challenge_timeout_ms: default_challenge_timeout_ms(),
            order: CheckOrder::default(),
        }
    }
}

fn default_challenge_timeout_ms() -> u64 {
    DEFAULT_CHALLENGE_TIMEOUT_MS
}

impl GateOptions {
    pub fn fail_closed(mut self) -> Self {
        self.on_store_error = StoreErrorPolicy::FailClosed;
        self
    }

    pub fn with_challenge(mut self) -> Self {
        self.require_challenge = true;
        self
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_order(mut self, order: CheckOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject options that would silently disable a check.
    pub fn validate(&self, action: &str) -> Result<()> {
        if let Some(min_score) = self.min_score {
            if !min_score.is_finite() {
                return Err(ConfigError::InvalidOptions {
                    action: action.to_string(),
                    reason: format!("min_score must be a finite number, got {}", min_score),
                });
            }
        }
        Ok(())
    }
}

/// Derives the throttle key from a request. `None` or a blank string means
/// "no identity", and the gate falls back to the caller's address.
pub type KeyFn<R> = Arc<dyn Fn(&R) -> Option<String> + Send + Sync>;

/// Builds gates that share one engine, clock and (optional) verifier.
pub struct GateComposer {
    engine: Arc<ThrottleEngine>,
    clock: Arc<dyn Clock>,
    verifier: Option<Arc<dyn ChallengeVerifier>>,
}

impl GateComposer {
    pub fn new(engine: Arc<ThrottleEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            verifier: None,
        }
    }

    /// Make a challenge verifier available to gates that require one.
    pub fn with_verifier(mut self, verifier: Arc<dyn ChallengeVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Build a gate for `action`.
    ///
    /// Fails if the action has no rule, if the options are invalid, or if the
    /// gate requires a challenge and no verifier was supplied.
    pub fn build_gate<R, F>(&self, action: &str, key_fn: F, options: GateOptions) -> Result<Gate<R>>
    where
        R: GateRequest,
        F: Fn(&R) -> Option<String> + Send + Sync + 'static,
    {
        self.engine.policies().get_rule(action)?;
        options.validate(action)?;

        let verifier = if options.require_challenge {
            let verifier = self
                .verifier
                .clone()
                .ok_or_else(|| ConfigError::MissingVerifier(action.to_string()))?;
            Some(verifier)
        } else {
            None
        };

        Ok(Gate {
            action: action.to_string(),
            key_fn: Arc::new(key_fn),
            engine: self.engine.clone(),
            clock: self.clock.clone(),
            verifier,
            options,
        })
    }
}

/// A guard placed in front of one sensitive operation.
pub struct Gate<R> {
    action: String,
    key_fn: KeyFn<R>,
    engine: Arc<ThrottleEngine>,
    clock: Arc<dyn Clock>,
    verifier: Option<Arc<dyn ChallengeVerifier>>,
    options: GateOptions,
}

/// Context accumulated by the stages a request has passed.
#[derive(Default)]
struct Passed {
    decision: Option<Decision>,
    challenge: Option<ChallengeVerdict>,
    degraded: Vec<Degradation>,
}

impl Passed {
    fn merge(mut self, other: Passed) -> Passed {
        self.decision = self.decision.or(other.decision);
        self.challenge = self.challenge.or(other.challenge);
        self.degraded.extend(other.degraded);
        self
    }
}

impl<R: GateRequest> Gate<R> {
    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn options(&self) -> &GateOptions {
        &self.options
    }

    /// The throttle key this gate uses for `request`.
    pub fn key_for(&self, request: &R) -> ThrottleKey {
        ThrottleKey::or_addr((self.key_fn)(request), request.remote_addr())
    }

    /// Decide whether `request` may proceed.
    ///
    /// # Panics
    ///
    /// Panics if the engine reports the action as unregistered. `build_gate`
    /// rejects such actions and the policy table is immutable, so a built
    /// gate never reaches this.
    #[instrument(skip(self, request), fields(action = %self.action))]
    pub async fn evaluate(&self, request: &R) -> GateOutcome {
        let key = self.key_for(request);

        let passed = match self.options.order {
            CheckOrder::ThrottleFirst => {
                let throttle = match self.check_throttle(&key).await {
                    Ok(passed) => passed,
                    Err(denied) => return denied,
                };
                match self.check_challenge(request).await {
                    Ok(challenge) => throttle.merge(challenge),
                    Err(denied) => {
                        return denied.with_context(throttle.decision, None, throttle.degraded)
                    }
                }
            }
            CheckOrder::ChallengeFirst => {
                let challenge = match self.check_challenge(request).await {
                    Ok(passed) => passed,
                    Err(denied) => return denied,
                };
                match self.check_throttle(&key).await {
                    Ok(throttle) => throttle.merge(challenge),
                    Err(denied) => {
                        return denied.with_context(None, challenge.challenge, challenge.degraded)
                    }
                }
            }
        };

        debug!(key = %key, degraded = ?passed.degraded, "Request allowed");
        GateOutcome::allowed(passed.decision, passed.challenge, passed.degraded)
    }

    /// Clear the throttle state for `request`, e.g. after a successful login.
    pub async fn reset(&self, request: &R) -> std::result::Result<(), EngineError> {
        self.engine.reset(&self.action, &self.key_for(request)).await
    }

    async fn check_throttle(&self, key: &ThrottleKey) -> std::result::Result<Passed, GateOutcome> {
        match self.engine.check(&self.action, key, self.clock.now()).await {
            Ok(decision) if decision.allowed => Ok(Passed {
                decision: Some(decision),
                ..Passed::default()
            }),
            Ok(decision) => Err(GateOutcome::throttled(decision)),
            Err(EngineError::StoreUnavailable(e)) => match self.options.on_store_error {
                StoreErrorPolicy::FailOpen => {
                    warn!(
                        action = %self.action,
                        key = %key,
                        error = %e,
                        "Counter store unavailable, failing open"
                    );
                    Ok(Passed {
                        degraded: vec![Degradation::StoreUnavailable],
                        ..Passed::default()
                    })
                }
                StoreErrorPolicy::FailClosed => {
                    error!(
                        action = %self.action,
                        key = %key,
                        error = %e,
                        "Counter store unavailable, failing closed"
                    );
                    Err(GateOutcome::service_unavailable())
                }
            },
            Err(EngineError::Config(e)) => {
                panic!("gate for '{}' is not backed by a registered rule: {}", self.action, e)
            }
        }
    }

    async fn check_challenge(&self, request: &R) -> std::result::Result<Passed, GateOutcome> {
        let Some(verifier) = &self.verifier else {
            return Ok(Passed::default());
        };

        if !verifier.is_enabled() {
            trace!(action = %self.action, "Challenge verification disabled, skipping");
            return Ok(Passed::default());
        }

        let Some(token) = request.challenge_token().filter(|t| !t.trim().is_empty()) else {
            debug!(action = %self.action, "Challenge token missing");
            return Err(GateOutcome::challenge_required());
        };

        let remote_addr = request.remote_addr();
        let timeout = Duration::from_millis(self.options.challenge_timeout_ms);
        let result = match tokio::time::timeout(timeout, verifier.verify(token, remote_addr)).await {
            Ok(result) => result,
            Err(_) => Err(ChallengeError::Timeout(timeout)),
        };

        let verdict = match result {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(
                    action = %self.action,
                    remote_addr = %remote_addr,
                    error = %e,
                    "Challenge verifier unreachable, failing open"
                );
                return Ok(Passed {
                    degraded: vec![Degradation::ChallengeUnreachable],
                    ..Passed::default()
                });
            }
        };

        if !verdict.success {
            debug!(
                action = %self.action,
                error_code = ?verdict.error_code,
                score = ?verdict.score,
                "Challenge failed"
            );
            return Err(GateOutcome::challenge_rejected(GateReason::ChallengeFailed, verdict));
        }

        if let (Some(min_score), Some(score)) = (self.options.min_score, verdict.score) {
            // NaN compares false against everything, so it is rejected explicitly.
            if !score.is_finite() || score < min_score {
                debug!(action = %self.action, score, min_score, "Challenge score too low");
                return Err(GateOutcome::challenge_rejected(GateReason::ScoreTooLow, verdict));
            }
        }

        Ok(Passed {
            challenge: Some(verdict),
            ..Passed::default()
        })
    }
}
