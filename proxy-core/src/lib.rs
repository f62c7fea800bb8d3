//! Proxy Core Library
//!
//! Core functionality of the intercepting proxy: the root certificate
//! authority and TLS glue, the request record codec, request storage, the
//! capture pipeline and the CONNECT/plain proxy paths.

pub mod ca;
pub mod capture;
pub mod forwarder;
/// Core proxy functionality modules
pub mod proxy;
pub mod record;
pub mod relay;
pub mod session;
pub mod store;
pub mod tls;

/// Configuration types and utilities
pub mod config;

/// Error types for proxy operations
pub mod error;

pub use ca::{LeafCertificate, RootAuthority};
pub use capture::CapturePipeline;
pub use config::{CaptureConfig, CertificateConfig, MethodFilter, ProxyConfig};
pub use error::ProxyError;
pub use forwarder::PlainForwarder;
/// Re-export commonly used types
pub use proxy::ProxyServer;
pub use record::{FormValues, MultipartForm, RequestRecord};
pub use session::{InterceptSession, Interceptor, SessionState};
pub use store::{MemoryRequestStore, NewRequest, RequestStore, StoredRequest};
pub use tls::{CachedCertificateProvider, CertificateProvider, DynamicCertResolver};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
