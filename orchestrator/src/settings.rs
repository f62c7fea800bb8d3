//! Orchestrator configuration: an optional TOML file overridden by CLI flags.

use crate::OrchestratorError;
use clap::{ArgAction, Parser};
use proxy_core::{MethodFilter, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::logging::LoggingConfig;
pub use attack_engine::ReplayConfig;

/// Complete runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Intercepting proxy settings
    pub proxy: ProxyConfig,
    /// Address the admin API listens on
    pub admin_address: String,
    pub database: DatabaseConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
    /// Keep captured requests after shutdown
    pub session_save: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            admin_address: "127.0.0.1:8000".to_string(),
            database: DatabaseConfig::default(),
            replay: ReplayConfig::default(),
            logging: LoggingConfig::default(),
            session_save: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:interceptor.db".to_string(),
            max_connections: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, OrchestratorError> {
        toml::from_str(raw).map_err(|e| OrchestratorError::Configuration(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, OrchestratorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!("read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// TLS-intercepting capture proxy with replay and injection scanning
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Proxy listen address
    #[arg(long)]
    pub proxy: Option<String>,

    /// Admin API listen address
    #[arg(long)]
    pub admin: Option<String>,

    /// Database connection URL
    #[arg(long)]
    pub database_url: Option<String>,

    /// Only save requests with this method, or "ALL METHODS"
    #[arg(long)]
    pub method: Option<String>,

    /// Max logged URI length
    #[arg(long)]
    pub length: Option<usize>,

    /// Keep the captured session after shutdown
    #[arg(long, action = ArgAction::Set)]
    pub save: Option<bool>,
}

impl Cli {
    /// Load the configuration file, if any, and apply the flags on top.
    pub fn load(&self) -> Result<OrchestratorConfig, OrchestratorError> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_file(path)?,
            None => OrchestratorConfig::default(),
        };
        self.apply(&mut config)?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut OrchestratorConfig) -> Result<(), OrchestratorError> {
        if let Some(proxy) = &self.proxy {
            config.proxy.listen_address = proxy.clone();
        }
        if let Some(admin) = &self.admin {
            config.admin_address = admin.clone();
        }
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(method) = &self.method {
            config.proxy.capture.method_filter = method.parse::<MethodFilter>()?;
        }
        if let Some(length) = self.length {
            config.proxy.capture.max_uri_length = length;
        }
        if let Some(save) = self.save {
            config.session_save = save;
        }
        Ok(())
    }
}
