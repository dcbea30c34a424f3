//! Error types for launchgate.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from the attribution provider and the endpoint provider.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Transport failed: {0}")]
    Network(String),

    #[error("Provider returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Provider rate limited the request after {attempts} attempts")]
    RateLimited { attempts: usize },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Malformed provider URL: {0}")]
    MalformedUrl(String),

    #[error("Request body could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ResolverError {
    /// Whether the failure is a transient network condition worth retrying.
    ///
    /// Only connection-level failures qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_status() && !e.is_decode() && !e.is_builder(),
            Self::Network(_) => true,
            _ => false,
        }
    }

    /// Whether an endpoint-resolution attempt that failed this way may be
    /// retried on the base schedule: transient transport failures and 2xx
    /// bodies that failed validation.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, Self::Parse(_))
    }
}

/// Failures from the remote verification read.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Verification read failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Verification read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Verification provider returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Invalid verification response: {0}")]
    InvalidResponse(String),
}

/// Failures from a persistent settings store.
///
/// Store callers treat these as "key absent"; they are only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
