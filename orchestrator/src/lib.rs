//! Orchestrator: wires the intercepting proxy, the request store and the
//! admin API into one process and owns its lifecycle.

use proxy_core::{
    CachedCertificateProvider, CapturePipeline, CertificateProvider, ProxyServer, RequestStore,
    RootAuthority,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod database;
pub mod error;
pub mod http;
pub mod logging;
pub mod settings;

pub use database::SqliteRequestStore;
pub use error::OrchestratorError;
pub use logging::{init_logging, LoggingConfig};
pub use settings::{Cli, DatabaseConfig, OrchestratorConfig};

pub struct Orchestrator {
    config: OrchestratorConfig,
}

/// Addresses the listeners actually bound to.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddresses {
    pub proxy: SocketAddr,
    pub admin: SocketAddr,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.run_until(shutdown_signal(), |_| {}).await
    }

    /// Run until `signal` resolves or a listener fails. `on_ready` sees the
    /// bound addresses once both listeners accept connections.
    pub async fn run_until<F, R>(&self, signal: F, on_ready: R) -> Result<(), OrchestratorError>
    where
        F: Future<Output = ()>,
        R: FnOnce(BoundAddresses),
    {
        let certs = &self.config.proxy.certificate_config;
        let authority = Arc::new(RootAuthority::bootstrap(&certs.ca_cert_path, &certs.ca_key_path)?);
        info!(
            "Root certificate {} valid until {}",
            authority.common_name(),
            authority.not_after()
        );
        let provider: Arc<dyn CertificateProvider> = if certs.cache_leaf_certificates {
            Arc::new(CachedCertificateProvider::new(authority))
        } else {
            authority
        };

        let store: Arc<dyn RequestStore> =
            Arc::new(SqliteRequestStore::connect(&self.config.database).await?);
        let pipeline = CapturePipeline::new(store.clone(), self.config.proxy.capture.clone());

        let proxy = ProxyServer::new(self.config.proxy.clone(), provider, pipeline)?;
        let proxy_listener = proxy.bind().await?;
        let admin_listener = TcpListener::bind(&self.config.admin_address)
            .await
            .map_err(|e| {
                OrchestratorError::Configuration(format!(
                    "bind {}: {}",
                    self.config.admin_address, e
                ))
            })?;
        let app = http::router(http::AdminState::new(store.clone(), &self.config.replay)?);

        let addresses = BoundAddresses {
            proxy: proxy_listener.local_addr()?,
            admin: admin_listener.local_addr()?,
        };
        info!("Admin API start listening on {}", addresses.admin);

        let shutdown = CancellationToken::new();
        let mut proxy_task = tokio::spawn(proxy.serve(proxy_listener, shutdown.clone()));
        let admin_shutdown = shutdown.clone();
        let mut admin_task = tokio::spawn(async move {
            axum::serve(admin_listener, app)
                .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
                .await
        });
        on_ready(addresses);

        tokio::select! {
            _ = signal => info!("Shutdown requested"),
            res = &mut proxy_task => error!("Proxy listener stopped: {:?}", res),
            res = &mut admin_task => error!("Admin listener stopped: {:?}", res),
        }
        shutdown.cancel();
        if !proxy_task.is_finished() {
            let _ = proxy_task.await;
        }
        if !admin_task.is_finished() {
            let _ = admin_task.await;
        }

        if self.config.session_save {
            info!("Prepare database... Save all new requests.");
        } else {
            match store.delete_all().await {
                Ok(()) => info!("Prepare database... Clear all requests."),
                Err(e) => warn!(error = %e, "Failed to clear stored requests"),
            }
        }
        info!("Server exiting");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
