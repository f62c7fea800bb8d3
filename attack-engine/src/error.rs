//! Error types for the attack engine

use http::StatusCode;
use proxy_core::ProxyError;
use thiserror::Error;

/// Main error type for replay and scan operations
#[derive(Debug, Error)]
pub enum AttackError {
    #[error("Timeout occurred: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Connection failed: {details}")]
    Dial { details: String },

    #[error("Network error: {details}")]
    Transport { details: String },

    #[error("Response decode failed: {reason}")]
    ResponseDecode { reason: String },

    #[error(transparent)]
    Record(#[from] ProxyError),
}

impl AttackError {
    /// Classify a reqwest failure for `operation`.
    pub fn from_reqwest(operation: &str, timeout_ms: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: operation.to_string(),
                duration_ms: timeout_ms,
            }
        } else if err.is_connect() {
            Self::Dial {
                details: err.to_string(),
            }
        } else {
            Self::Transport {
                details: err.to_string(),
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Record(inner) => inner.is_timeout(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } | Self::Dial { .. } | Self::Transport { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ResponseDecode { .. } => StatusCode::BAD_GATEWAY,
            Self::Record(inner) => inner.status_code(),
        }
    }
}

/// Result type alias for attack engine operations
pub type AttackResult<T> = Result<T, AttackError>;
