//! Bidirectional byte relay with capture of the client-to-server direction.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_BUFFER: usize = 8 * 1024;

/// Copy `src` into `dst` while appending bytes to `capture` until it holds
/// `limit` bytes. Copying carries on after the capture is full.
pub async fn copy_tee<R, W>(
    src: &mut R,
    dst: &mut W,
    capture: &mut Vec<u8>,
    limit: usize,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            // TLS peers that skip close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n]).await?;
        let room = limit.saturating_sub(capture.len());
        if room > 0 {
            capture.extend_from_slice(&buf[..n.min(room)]);
            if n >= room {
                debug!(limit, "Capture limit reached, relaying without capture");
            }
        }
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

/// Pump bytes both ways until either side finishes, then close both.
///
/// Returns what the client sent, up to `capture_limit` bytes. Errors on
/// either leg only end the relay; the peer's follow-up failures are expected
/// and ignored.
pub async fn relay<C, U>(client: C, upstream: U, capture_limit: usize) -> Vec<u8>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let done = CancellationToken::new();

    let token = done.clone();
    let server_to_client = tokio::spawn(async move {
        tokio::select! {
            result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
                if let Err(e) = result {
                    debug!(error = %e, "server->client copy ended");
                }
            }
            _ = token.cancelled() => {}
        }
        let _ = client_write.shutdown().await;
        token.cancel();
    });

    let token = done.clone();
    let client_to_server = tokio::spawn(async move {
        let mut captured = Vec::new();
        tokio::select! {
            result = copy_tee(&mut client_read, &mut upstream_write, &mut captured, capture_limit) => {
                if let Err(e) = result {
                    debug!(error = %e, "client->server copy ended");
                }
            }
            _ = token.cancelled() => {}
        }
        let _ = upstream_write.shutdown().await;
        token.cancel();
        captured
    });

    let _ = server_to_client.await;
    client_to_server.await.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[tokio::test]
    async fn tee_copies_and_captures() {
        let mut src: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        let mut dst = Vec::new();
        let mut captured = Vec::new();
        let n = copy_tee(&mut src, &mut dst, &mut captured, usize::MAX)
            .await
            .unwrap();
        assert_eq!(n, 18);
        assert_eq!(dst, captured);
    }

    #[tokio::test]
    async fn capture_stops_at_limit_but_copy_continues() {
        let data = vec![b'x'; 3 * RELAY_BUFFER];
        let mut src: &[u8] = &data;
        let mut dst = Vec::new();
        let mut captured = Vec::new();
        let n = copy_tee(&mut src, &mut dst, &mut captured, 100).await.unwrap();
        assert_eq!(n as usize, data.len());
        assert_eq!(dst, data);
        assert_eq!(captured.len(), 100);
    }

    #[tokio::test]
    async fn upstream_close_closes_client_leg() {
        let (mut client_app, client_proxy) = duplex(1024);
        let (upstream_proxy, mut upstream_app) = duplex(1024);
        let relay = tokio::spawn(relay(client_proxy, upstream_proxy, 1024));

        client_app.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        upstream_app.write_all(b"world").await.unwrap();
        drop(upstream_app);

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), client_app.read_to_end(&mut received))
            .await
            .expect("client leg closed")
            .unwrap();
        assert_eq!(received, b"world");

        let captured = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(captured, b"hello");
    }

    #[tokio::test]
    async fn client_close_closes_upstream_leg() {
        let (mut client_app, client_proxy) = duplex(1024);
        let (upstream_proxy, mut upstream_app) = duplex(1024);
        let relay = tokio::spawn(relay(client_proxy, upstream_proxy, 2));

        client_app.write_all(b"ping").await.unwrap();
        drop(client_app);

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), upstream_app.read_to_end(&mut received))
            .await
            .expect("upstream leg closed")
            .unwrap();
        assert_eq!(received, b"ping");

        // Everything is relayed; only the first two bytes are kept.
        let captured = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(captured, b"pi");
    }
}
