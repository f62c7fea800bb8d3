use attack_engine::AttackError;
use proxy_core::ProxyError;
use thiserror::Error;

/// Errors raised while configuring and running the orchestrator
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Attack(#[from] AttackError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
