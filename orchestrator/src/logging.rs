use crate::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration for the interceptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to enable JSON formatted logs
    pub json_format: bool,

    /// Whether to include thread names in logs
    pub include_thread_names: bool,

    /// Whether to include file and line number information
    pub include_file_info: bool,

    /// Whether to enable span events (enter/exit)
    pub enable_span_events: bool,

    /// Whether to enable colored output (only for non-JSON format)
    pub enable_colors: bool,

    /// Log file path (optional, if None logs only to stdout)
    pub log_file: Option<String>,

    /// Module-specific log levels
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = BTreeMap::new();
        module_levels.insert("orchestrator".to_string(), "info".to_string());
        module_levels.insert("proxy_core".to_string(), "info".to_string());
        module_levels.insert("attack_engine".to_string(), "info".to_string());
        module_levels.insert("sqlx".to_string(), "warn".to_string());
        module_levels.insert("hyper".to_string(), "warn".to_string());
        module_levels.insert("rustls".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            json_format: false,
            include_thread_names: false,
            include_file_info: false,
            enable_span_events: false,
            enable_colors: true,
            log_file: None,
            module_levels,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter, OrchestratorError> {
        // RUST_LOG wins over the configured directives.
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        if !levels::is_valid_level(&self.level) {
            return Err(OrchestratorError::Logging(format!(
                "Invalid log level {:?}, expected one of {:?}",
                self.level,
                levels::valid_levels()
            )));
        }

        let mut filter = EnvFilter::new(&self.level);
        for (module, level) in &self.module_levels {
            let directive = format!("{}={}", module, level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| OrchestratorError::Logging(format!("Invalid log directive: {}", e)))?,
            );
        }
        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging based on the provided configuration.
///
/// The returned guard flushes the file writer and must be held until exit.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, OrchestratorError> {
    let filter = config.filter()?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let stdout = fmt::layer()
        .with_target(true)
        .with_thread_names(config.include_thread_names)
        .with_file(config.include_file_info)
        .with_line_number(config.include_file_info)
        .with_span_events(config.span_events());
    if config.json_format {
        layers.push(stdout.json().boxed());
    } else {
        layers.push(stdout.with_ansi(config.enable_colors).boxed());
    }

    let mut guard = None;
    if let Some(log_file) = &config.log_file {
        let (writer, file_guard) = tracing_appender::non_blocking(create_file_appender(log_file)?);
        let file = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer);
        if config.json_format {
            layers.push(file.json().boxed());
        } else {
            layers.push(file.boxed());
        }
        guard = Some(file_guard);
    }

    match tracing_subscriber::registry().with(layers).with(filter).try_init() {
        Ok(()) => tracing::info!("Logging initialized with config level: {}", config.level),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}

/// Daily-rolling appender writing next to `log_file`.
fn create_file_appender(
    log_file: &str,
) -> Result<tracing_appender::rolling::RollingFileAppender, OrchestratorError> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let log_path = Path::new(log_file);
    let directory = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let filename = log_path
        .file_name()
        .ok_or_else(|| OrchestratorError::Logging("Invalid log file name".to_string()))?
        .to_string_lossy();

    std::fs::create_dir_all(directory)
        .map_err(|e| OrchestratorError::Logging(format!("Failed to create log directory: {}", e)))?;

    Ok(RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        filename.as_ref(),
    ))
}

/// Log level utilities
pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }

    pub fn valid_levels() -> Vec<&'static str> {
        vec!["trace", "debug", "info", "warn", "error"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(!config.json_format);
        assert!(config.enable_colors);
        assert!(config.log_file.is_none());
        assert_eq!(config.module_levels["sqlx"], "warn");
    }

    #[test]
    fn test_log_level_validation() {
        assert!(levels::is_valid_level("info"));
        assert!(levels::is_valid_level("DEBUG"));
        assert!(!levels::is_valid_level("loud"));
        assert!(!levels::is_valid_level(""));
    }

    #[test]
    fn bad_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.filter(), Err(OrchestratorError::Logging(_))));
    }

    #[test]
    fn file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("interceptor.log");
        create_file_appender(path.to_str().unwrap()).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
