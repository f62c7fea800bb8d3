use crate::{
    capture::CapturePipeline,
    config::ProxyConfig,
    error::ProxyError,
    forwarder::PlainForwarder,
    session::{error_response, Interceptor},
    tls::{self, CertificateProvider},
    Result,
};
use bytes::{Buf, Bytes, BytesMut};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEAD_HEADERS: usize = 64;
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The intercepting proxy: CONNECT tunnels go through an intercept session,
/// everything else through the plain forwarder.
pub struct ProxyServer {
    config: ProxyConfig,
    interceptor: Interceptor,
    forwarder: PlainForwarder,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        provider: Arc<dyn CertificateProvider>,
        pipeline: CapturePipeline,
    ) -> Result<Self> {
        let upstream = tls::client_config(config.verify_upstream)?;
        let interceptor = Interceptor::new(provider, upstream, config.dial_timeout(), pipeline.clone());
        let forwarder = PlainForwarder::new(pipeline)?;
        Ok(Self {
            config,
            interceptor,
            forwarder,
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                ProxyError::Configuration(format!("bind {}: {}", self.config.listen_address, e))
            })
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections until `shutdown` fires. Per-connection failures are
    /// logged and never stop the listener.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("Proxy start listening on {}", listener.local_addr()?);

        let mut failures: u32 = 0;
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Errors such as EMFILE persist until descriptors free up.
                        let delay = accept_backoff(failures);
                        failures = failures.saturating_add(1);
                        warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Accept failed");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => {
                                info!("Proxy listener stopped");
                                return Ok(());
                            }
                        }
                        continue;
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Proxy listener stopped");
                    return Ok(());
                }
            };
            failures = 0;

            let interceptor = self.interceptor.clone();
            let forwarder = self.forwarder.for_peer(peer);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, interceptor, forwarder).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

/// Delay before retrying after `failures` consecutive accept errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_START
        .checked_mul(1u32.checked_shl(failures).unwrap_or(u32::MAX))
        .map_or(ACCEPT_BACKOFF_MAX, |delay| delay.min(ACCEPT_BACKOFF_MAX))
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    interceptor: Interceptor,
    forwarder: PlainForwarder,
) -> Result<()> {
    let (buffered, head) = match read_head(&mut stream).await {
        Ok(Some(read)) => read,
        Ok(None) => return Ok(()),
        Err(e) => {
            let _ = stream
                .write_all(&error_response(e.status_code(), &e.to_string()))
                .await;
            return Err(e);
        }
    };

    if head.method == "CONNECT" {
        let mut leftover = buffered;
        leftover.advance(head.len);
        let session = match interceptor.session(&head.target, Some(peer)) {
            Ok(session) => session,
            Err(e) => {
                error!(target = %head.target, error = %e, "Bad CONNECT target");
                let _ = stream
                    .write_all(&error_response(e.status_code(), &e.to_string()))
                    .await;
                return Err(e);
            }
        };
        session.run(Rewind::new(stream, leftover.freeze())).await?;
        return Ok(());
    }

    let io = TokioIo::new(Rewind::new(stream, buffered.freeze()));
    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = forwarder.clone();
        async move { Ok::<_, Infallible>(forwarder.handle(req).await) }
    });
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| ProxyError::Transport(e.to_string()))
}

struct RequestHead {
    method: String,
    target: String,
    len: usize,
}

/// Read until a full request head is buffered. `None` if the client hung up
/// before sending anything parsable.
async fn read_head(stream: &mut TcpStream) -> Result<Option<(BytesMut, RequestHead)>> {
    let mut buffered = BytesMut::with_capacity(4096);
    loop {
        if stream.read_buf(&mut buffered).await? == 0 {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEAD_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buffered) {
            Ok(httparse::Status::Complete(len)) => {
                let head = RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    len,
                };
                return Ok(Some((buffered, head)));
            }
            Ok(httparse::Status::Partial) if buffered.len() < MAX_HEAD_SIZE => continue,
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::BodyRead("request head too large".to_string()))
            }
            Err(e) => return Err(ProxyError::BodyRead(format!("malformed request head: {}", e))),
        }
    }
}

/// Replays already-read bytes before reading from the wrapped stream.
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Bytes) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
