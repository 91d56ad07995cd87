//! Secondary challenge verification (CAPTCHA-style).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::ChallengeError;

/// What the verifier said about a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeVerdict {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ChallengeVerdict {
    pub fn passed(score: Option<f64>) -> Self {
        Self {
            success: true,
            score,
            error_code: None,
        }
    }

    pub fn failed(error_code: impl Into<String>) -> Self {
        Self {
            success: false,
            score: None,
            error_code: Some(error_code.into()),
        }
    }
}

/// A third-party challenge check.
///
/// `is_enabled` is the process-wide toggle; when it returns `false` gates skip
/// the challenge entirely. A transport error from `verify` makes the gate
/// fail open.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn verify(&self, token: &str, remote_addr: IpAddr) -> Result<ChallengeVerdict, ChallengeError>;
}
