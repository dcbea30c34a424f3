//! One-shot remote verification gating the resolution pipeline.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::VerificationError;

/// Single remote boolean check.
#[async_trait]
pub trait VerificationGate: Send + Sync {
    async fn verify(&self) -> Result<bool, VerificationError>;
}

/// A remote value verifies when it is a non-empty, syntactically valid URL.
pub fn is_verified_value(value: &Value) -> bool {
    match value.as_str().map(str::trim) {
        Some(s) if !s.is_empty() => url::Url::parse(s).is_ok(),
        _ => false,
    }
}

/// Reads the remote value with a GET returning a JSON document, as a
/// REST-style realtime database exposes it.
#[derive(Debug, Clone)]
pub struct RemoteValueGate {
    client: Client,
    url: String,
    timeout: Duration,
}

impl RemoteValueGate {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl VerificationGate for RemoteValueGate {
    async fn verify(&self) -> Result<bool, VerificationError> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VerificationError::Timeout(self.timeout)
                } else {
                    VerificationError::Transport(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VerificationError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| VerificationError::InvalidResponse(e.to_string()))?;
        let verified = is_verified_value(&value);
        tracing::debug!(verified, "Remote verification value read");
        Ok(verified)
    }
}

/// Fixed answer, for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate(pub bool);

#[async_trait]
impl VerificationGate for StaticGate {
    async fn verify(&self) -> Result<bool, VerificationError> {
        Ok(self.0)
    }
}
