//! Error types for throttlegate.
//!
//! Only [`ConfigError`] represents a programmer mistake. Store and challenge
//! failures are recoverable conditions that the gate turns into outcomes.

use std::time::Duration;

use thiserror::Error;

/// Configuration-related errors.
///
/// These surface at startup or integration time and must never be turned
/// into an allow decision.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The action has no registered rule.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// The action was registered twice.
    #[error("Duplicate action: {0}")]
    DuplicateAction(String),

    /// A rule failed validation.
    #[error("Invalid rule for action '{action}': {reason}")]
    InvalidRule { action: String, reason: String },

    /// Gate options failed validation.
    #[error("Invalid gate options for action '{action}': {reason}")]
    InvalidOptions { action: String, reason: String },

    /// A gate requires a challenge but the composer has no verifier.
    #[error("Gate for action '{0}' requires a challenge but no verifier is configured")]
    MissingVerifier(String),

    /// The configuration could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reaching the counter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store rejected or could not serve the request.
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured bound.
    #[error("Counter store timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures reaching the challenge verifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("Challenge verifier transport error: {0}")]
    Transport(String),

    #[error("Challenge verifier timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the throttle engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

/// Result type alias for configuration-time operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
