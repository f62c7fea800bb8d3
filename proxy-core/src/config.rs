//! Configuration types and utilities

use crate::error::ProxyError;
use http::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Value of the method filter that persists every captured request.
pub const ALL_METHODS: &str = "ALL METHODS";

/// Methods accepted by the method filter.
pub const ALLOWED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "CONNECT", "DELETE", "OPTIONS", "PATCH", "TRACE",
];

/// Static proxy configuration, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the intercepting proxy listens on
    pub listen_address: String,
    /// Certificate configuration
    pub certificate_config: CertificateConfig,
    /// Capture configuration
    pub capture: CaptureConfig,
    /// Verify upstream certificates when dialing intercepted targets
    pub verify_upstream: bool,
    /// Upstream dial timeout in seconds
    pub dial_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8080".to_string(),
            certificate_config: CertificateConfig::default(),
            capture: CaptureConfig::default(),
            verify_upstream: true,
            dial_timeout_secs: 30,
        }
    }
}

impl ProxyConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Root certificate (PEM)
    pub ca_cert_path: PathBuf,
    /// Root private key (PEM)
    pub ca_key_path: PathBuf,
    /// Reuse issued leaf certificates per host until shortly before they expire
    pub cache_leaf_certificates: bool,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: PathBuf::from("cert/ca.crt"),
            ca_key_path: PathBuf::from("cert/ca.key"),
            cache_leaf_certificates: false,
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Which captured requests are persisted; the rest are only logged
    pub method_filter: MethodFilter,
    /// Logged request URIs longer than this are trimmed
    pub max_uri_length: usize,
    /// Client bytes kept per tunnel for request parsing; relaying continues
    /// past the limit without capture
    pub max_tunnel_capture: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            method_filter: MethodFilter::All,
            max_uri_length: 100,
            max_tunnel_capture: 16 * 1024 * 1024,
        }
    }
}

/// Persist either every request or only one method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MethodFilter {
    #[default]
    All,
    Only(Method),
}

impl MethodFilter {
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodFilter::All => true,
            MethodFilter::Only(only) => only == method,
        }
    }
}

impl FromStr for MethodFilter {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == ALL_METHODS {
            return Ok(MethodFilter::All);
        }
        if !ALLOWED_METHODS.contains(&upper.as_str()) {
            return Err(ProxyError::Configuration(format!(
                "Allowed methods: {}",
                ALLOWED_METHODS.join(", ")
            )));
        }
        Method::from_bytes(upper.as_bytes())
            .map(MethodFilter::Only)
            .map_err(|e| ProxyError::Configuration(e.to_string()))
    }
}

impl fmt::Display for MethodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodFilter::All => f.write_str(ALL_METHODS),
            MethodFilter::Only(method) => f.write_str(method.as_str()),
        }
    }
}

impl Serialize for MethodFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MethodFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
