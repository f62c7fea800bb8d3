//! Error types for proxy operations

use http::StatusCode;
use thiserror::Error;

/// Main error type for interception, capture and storage operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Key or certificate generation/parsing failed
    #[error("Crypto error: {0}")]
    Crypto(String),
    /// CA material could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),
    /// The loaded root certificate cannot sign leaves
    #[error("CA cert is not a CA")]
    NotACertificateAuthority,
    /// Upstream connection or TLS handshake failed
    #[error("Dial error: {0}")]
    Dial(String),
    /// An operation exceeded its time budget
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
    /// Generic network failure after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),
    /// Request body stream could not be read
    #[error("Body read error: {0}")]
    BodyRead(String),
    /// Query or form body is malformed
    #[error("Form parse error: {0}")]
    FormParse(String),
    /// A stored record could not be turned back into a request
    #[error("Decode error: {0}")]
    Decode(String),
    /// The client transport cannot be taken over for tunneling
    #[error("Hijacking not supported")]
    HijackUnsupported,
    /// Requested record does not exist
    #[error("Request {0} not found")]
    NotFound(i64),
    /// Request store failure
    #[error("Store error: {0}")]
    Store(String),
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code a client of the proxy or admin API should see for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Crypto(_)
            | ProxyError::Dial(_)
            | ProxyError::Timeout { .. }
            | ProxyError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BodyRead(_) | ProxyError::FormParse(_) | ProxyError::Decode(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::NotACertificateAuthority
            | ProxyError::Persistence(_)
            | ProxyError::HijackUnsupported
            | ProxyError::Store(_)
            | ProxyError::Configuration(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProxyError::Timeout { .. })
    }
}
