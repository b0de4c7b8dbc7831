//! Remote token verification.
//!
//! A definitive rejection and an unreachable verifier are different outcomes:
//! the first signs the user out, the second does not.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Definitive answer from the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// Network error, timeout, or a response that is not a verdict.
    #[error("verifier unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait RemoteVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Verdict, VerifyError>;
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Verifier backed by an authenticated HTTP endpoint.
///
/// `GET <url>` with `Authorization: Bearer <token>`, expecting `{"valid": bool}`.
/// 401/403 count as a definitive rejection.
pub struct HttpVerifier {
    client: Client,
    url: String,
}

impl HttpVerifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> authsync_core::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| authsync_core::Error::Verifier(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteVerifier for HttpVerifier {
    async fn verify(&self, token: &str) -> Result<Verdict, VerifyError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| VerifyError::Unreachable(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!("Verifier rejected token with status {}", status);
            return Ok(Verdict::Invalid);
        }
        if !status.is_success() {
            return Err(VerifyError::Unreachable(format!("status {}", status)));
        }

        let body: VerifyResponse = response
            .json()
            .await
            .map_err(|e| VerifyError::Unreachable(format!("malformed response: {}", e)))?;
        Ok(if body.valid {
            Verdict::Valid
        } else {
            Verdict::Invalid
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_is_not_a_rejection() {
        // Port 1 on localhost refuses connections.
        let verifier =
            HttpVerifier::new("http://127.0.0.1:1/auth/verify", Duration::from_secs(2)).unwrap();
        let result = verifier.verify("t1").await;
        assert!(matches!(result, Err(VerifyError::Unreachable(_))));
    }

    #[test]
    fn test_verify_error_display() {
        assert_eq!(
            VerifyError::Unreachable("timeout".into()).to_string(),
            "verifier unreachable: timeout"
        );
    }
}
