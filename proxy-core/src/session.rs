//! CONNECT tunnel interception.

use crate::ca::LeafCertificate;
use crate::capture::CapturePipeline;
use crate::error::ProxyError;
use crate::relay::relay;
use crate::tls::{self, CertificateProvider, DynamicCertResolver};
use crate::Result;
use http::uri::Authority;
use http::StatusCode;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

/// Reply to a CONNECT once the upstream leg is up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

const DEFAULT_TLS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    CertIssued,
    Dialed,
    Hijacked,
    Relaying,
    Closed,
    Failed,
}

/// Everything sessions share: certificate source, upstream TLS settings and
/// the capture pipeline.
#[derive(Clone)]
pub struct Interceptor {
    provider: Arc<dyn CertificateProvider>,
    connector: TlsConnector,
    dial_timeout: Duration,
    pipeline: CapturePipeline,
}

impl Interceptor {
    pub fn new(
        provider: Arc<dyn CertificateProvider>,
        upstream: ClientConfig,
        dial_timeout: Duration,
        pipeline: CapturePipeline,
    ) -> Self {
        Self {
            provider,
            connector: TlsConnector::from(Arc::new(upstream)),
            dial_timeout,
            pipeline,
        }
    }

    pub fn session(&self, target: &str, client_addr: Option<SocketAddr>) -> Result<InterceptSession> {
        InterceptSession::new(self.clone(), target, client_addr)
    }
}

/// One intercepted tunnel. Owns both connection ends until either closes.
pub struct InterceptSession {
    ctx: Interceptor,
    host: String,
    authority: String,
    client_addr: Option<SocketAddr>,
    state: SessionState,
}

impl InterceptSession {
    fn new(ctx: Interceptor, target: &str, client_addr: Option<SocketAddr>) -> Result<Self> {
        let authority: Authority = target
            .parse()
            .map_err(|e| ProxyError::Dial(format!("invalid CONNECT target {:?}: {}", target, e)))?;
        let port = authority.port_u16().unwrap_or(DEFAULT_TLS_PORT);
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let authority = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        Ok(Self {
            ctx,
            host,
            authority,
            client_addr,
            state: SessionState::Init,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn transition(&mut self, next: SessionState) {
        debug!(host = %self.host, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Drive the tunnel over the raw client transport.
    ///
    /// `client` must be positioned right after the CONNECT request head.
    pub async fn run<IO>(mut self, mut client: IO) -> Result<SessionState>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let leaf = match self.ctx.provider.issue_for(&self.host) {
            Ok(leaf) => leaf,
            Err(e) => {
                error!(host = %self.host, error = %e, "Error while generating certificates");
                return self.fail(&mut client, StatusCode::SERVICE_UNAVAILABLE, e).await;
            }
        };
        self.transition(SessionState::CertIssued);

        let upstream = match self.dial().await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(target = %self.authority, error = %e, "Service unavailable");
                return self.fail(&mut client, StatusCode::SERVICE_UNAVAILABLE, e).await;
            }
        };
        self.transition(SessionState::Dialed);

        if let Err(e) = write_all_flush(&mut client, CONNECT_ESTABLISHED).await {
            error!(error = %e, "Unable to install conn");
            self.transition(SessionState::Failed);
            return Err(e.into());
        }
        self.transition(SessionState::Hijacked);

        let client_tls = match self.accept(client, &leaf).await {
            Ok(tls) => tls,
            Err(e) => {
                warn!(host = %self.host, error = %e, "Client TLS handshake failed");
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };
        self.transition(SessionState::Relaying);

        let captured = relay(
            client_tls,
            upstream,
            self.ctx.pipeline.tunnel_capture_limit(),
        )
        .await;
        self.transition(SessionState::Closed);
        info!(host = %self.host, captured = captured.len(), "Tunnel closed");

        self.ctx
            .pipeline
            .capture_raw(&captured, true, self.client_addr);
        Ok(self.state)
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>> {
        let server_name = tls::server_name(&self.host)?;
        let connect = async {
            let tcp = TcpStream::connect(&self.authority)
                .await
                .map_err(|e| ProxyError::Dial(format!("{}: {}", self.authority, e)))?;
            self.ctx
                .connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::Dial(format!("TLS to {}: {}", self.authority, e)))
        };

        tokio::time::timeout(self.dial_timeout(), connect)
            .await
            .map_err(|_| ProxyError::Timeout {
                operation: format!("dial {}", self.authority),
                duration_ms: self.dial_timeout().as_millis() as u64,
            })?
    }

    fn dial_timeout(&self) -> Duration {
        self.ctx.dial_timeout
    }

    async fn accept<IO>(
        &self,
        client: IO,
        leaf: &LeafCertificate,
    ) -> Result<tokio_rustls::server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let resolver = DynamicCertResolver::new(self.ctx.provider.clone(), leaf)?;
        let config = tls::server_config(Arc::new(resolver))?;
        TlsAcceptor::from(Arc::new(config))
            .accept(client)
            .await
            .map_err(|e| ProxyError::Transport(format!("client handshake: {}", e)))
    }

    /// Answer the CONNECT with `status` and give up. Setup failures are
    /// always reported as the tunnel being unavailable.
    async fn fail<IO>(
        &mut self,
        client: &mut IO,
        status: StatusCode,
        err: ProxyError,
    ) -> Result<SessionState>
    where
        IO: AsyncWrite + Unpin,
    {
        self.transition(SessionState::Failed);
        let _ = write_all_flush(client, &error_response(status, &err.to_string())).await;
        let _ = client.shutdown().await;
        Err(err)
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin + ?Sized>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    w.write_all(data).await?;
    w.flush().await
}

/// Plain-text error reply written straight to a raw connection.
pub fn error_response(status: StatusCode, message: &str) -> Vec<u8> {
    let body = format!("{}\n", message);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::RootAuthority;
    use crate::config::CaptureConfig;
    use crate::store::MemoryRequestStore;
    use tokio::io::{duplex, AsyncReadExt};

    fn interceptor(dir: &std::path::Path) -> Interceptor {
        let authority =
            RootAuthority::bootstrap(&dir.join("ca.crt"), &dir.join("ca.key")).unwrap();
        with_authority(authority)
    }

    fn with_authority(authority: RootAuthority) -> Interceptor {
        let pipeline = CapturePipeline::new(
            Arc::new(MemoryRequestStore::new()),
            CaptureConfig::default(),
        );
        Interceptor::new(
            Arc::new(authority),
            tls::client_config(false).unwrap(),
            Duration::from_secs(2),
            pipeline,
        )
    }

    #[test]
    fn target_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = interceptor(dir.path());

        let session = ctx.session("example.com:8443", None).unwrap();
        assert_eq!(session.host(), "example.com");
        assert_eq!(session.authority, "example.com:8443");
        assert_eq!(session.state(), SessionState::Init);

        let session = ctx.session("example.com", None).unwrap();
        assert_eq!(session.authority, "example.com:443");

        let session = ctx.session("[::1]:9443", None).unwrap();
        assert_eq!(session.host(), "::1");
        assert_eq!(session.authority, "[::1]:9443");
    }

    #[tokio::test]
    async fn dial_failure_answers_503() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = interceptor(dir.path());

        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let session = ctx.session(&format!("127.0.0.1:{}", port), None).unwrap();

        let (mut client_app, client_proxy) = duplex(4096);
        let result = session.run(client_proxy).await;
        assert!(matches!(result, Err(ProxyError::Dial(_))));

        let mut reply = String::new();
        client_app.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[tokio::test]
    async fn issuance_failure_answers_503() {
        let mut params = rcgen::CertificateParams::new(vec!["not-a-ca.test".to_string()]);
        params.is_ca = rcgen::IsCa::NoCa;
        let plain = rcgen::Certificate::from_params(params).unwrap();
        let authority = RootAuthority::from_pem(
            &plain.serialize_pem().unwrap(),
            &plain.serialize_private_key_pem(),
        )
        .unwrap();
        let session = with_authority(authority)
            .session("example.com:443", None)
            .unwrap();

        let (mut client_app, client_proxy) = duplex(4096);
        let result = session.run(client_proxy).await;
        assert!(matches!(result, Err(ProxyError::NotACertificateAuthority)));

        let mut reply = String::new();
        client_app.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    }

    #[test]
    fn error_response_has_length() {
        let raw = String::from_utf8(error_response(StatusCode::INTERNAL_SERVER_ERROR, "boom")).unwrap();
        assert!(raw.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(raw.contains("Content-Length: 5\r\n"));
        assert!(raw.ends_with("\r\n\r\nboom\n"));
    }
}
