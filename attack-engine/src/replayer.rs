//! Replaying stored requests against their origin.

use crate::error::{AttackError, AttackResult};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Request, StatusCode};
use proxy_core::forwarder::strip_hop_by_hop;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// Default timeout for replays to HTTPS origins.
pub const DEFAULT_HTTPS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Whole-exchange timeout for HTTPS replays, in milliseconds.
    pub https_timeout_ms: u64,
    /// Whether HTTPS replays follow redirects.
    pub follow_redirects: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            https_timeout_ms: DEFAULT_HTTPS_TIMEOUT.as_millis() as u64,
            follow_redirects: true,
        }
    }
}

/// Fully read origin response.
#[derive(Debug, Clone)]
pub struct ReplayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReplayResponse {
    /// True when any `Content-Encoding` value names gzip.
    pub fn is_gzip(&self) -> bool {
        self.headers
            .get_all(CONTENT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("gzip"))
    }

    /// Body bytes, gunzipped when `gzipped` is set.
    pub fn decoded_body(&self, gzipped: bool) -> AttackResult<Vec<u8>> {
        if !gzipped {
            return Ok(self.body.to_vec());
        }
        let mut out = Vec::new();
        GzDecoder::new(&self.body[..])
            .read_to_end(&mut out)
            .map_err(|e| AttackError::ResponseDecode {
                reason: format!("gzip: {}", e),
            })?;
        Ok(out)
    }
}

/// Sends one request and reads the whole response.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: Request<Bytes>, is_https: bool) -> AttackResult<ReplayResponse>;
}

/// Replays requests with reqwest.
///
/// HTTPS replays skip certificate verification and are bounded by a timeout
/// that covers reading the body. Plain HTTP replays have no timeout and never
/// follow redirects.
#[derive(Clone)]
pub struct Replayer {
    https: reqwest::Client,
    http: reqwest::Client,
    https_timeout: Duration,
}

impl Replayer {
    pub fn new(config: &ReplayConfig) -> AttackResult<Self> {
        let https_timeout = Duration::from_millis(config.https_timeout_ms);
        let redirects = if config.follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };

        let https = reqwest::Client::builder()
            .timeout(https_timeout)
            .danger_accept_invalid_certs(true)
            .redirect(redirects)
            .no_proxy()
            .build()
            .map_err(|e| AttackError::Transport {
                details: format!("https client: {}", e),
            })?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| AttackError::Transport {
                details: format!("http client: {}", e),
            })?;

        Ok(Self {
            https,
            http,
            https_timeout,
        })
    }

    fn timeout_ms(&self, is_https: bool) -> u64 {
        if is_https {
            self.https_timeout.as_millis() as u64
        } else {
            0
        }
    }
}

#[async_trait]
impl RequestSender for Replayer {
    async fn send(&self, request: Request<Bytes>, is_https: bool) -> AttackResult<ReplayResponse> {
        let operation = format!("{} {}", request.method(), request.uri());
        let timeout_ms = self.timeout_ms(is_https);
        debug!("Replaying {}", operation);

        let (mut parts, body) = request.into_parts();
        parts.headers = strip_hop_by_hop(parts.headers);
        let request = reqwest::Request::try_from(Request::from_parts(parts, body)).map_err(|e| {
            AttackError::Transport {
                details: format!("{}: {}", operation, e),
            }
        })?;

        let client = if is_https { &self.https } else { &self.http };
        let response = client
            .execute(request)
            .await
            .map_err(|e| AttackError::from_reqwest(&operation, timeout_ms, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AttackError::from_reqwest(&operation, timeout_ms, e))?;

        Ok(ReplayResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http::HeaderValue;
    use std::io::Write;

    fn response(encoding: Option<&'static str>, body: Bytes) -> ReplayResponse {
        let mut headers = HeaderMap::new();
        if let Some(encoding) = encoding {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }
        ReplayResponse {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    #[test]
    fn gzip_detection() {
        assert!(response(Some("gzip"), Bytes::new()).is_gzip());
        assert!(response(Some("br, gzip"), Bytes::new()).is_gzip());
        assert!(!response(Some("br"), Bytes::new()).is_gzip());
        assert!(!response(None, Bytes::new()).is_gzip());
    }

    #[test]
    fn gzip_body_is_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"root:x:0:0").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        let resp = response(Some("gzip"), compressed.clone());
        assert_eq!(resp.decoded_body(true).unwrap(), b"root:x:0:0");
        assert_eq!(resp.decoded_body(false).unwrap(), compressed.to_vec());
    }

    #[test]
    fn garbage_gzip_is_a_decode_error() {
        let resp = response(Some("gzip"), Bytes::from_static(b"not gzip"));
        assert!(matches!(
            resp.decoded_body(true),
            Err(AttackError::ResponseDecode { .. })
        ));
    }

    #[tokio::test]
    async fn plain_replay_does_not_follow_redirects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/old",
            axum::routing::get(|| async { axum::response::Redirect::temporary("/new") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let replayer = Replayer::new(&ReplayConfig::default()).unwrap();
        let request = Request::get(format!("http://{}/old", addr))
            .body(Bytes::new())
            .unwrap();
        let resp = replayer.send(request, false).await.unwrap();
        assert_eq!(resp.status, StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers["location"], "/new");
    }

    #[tokio::test]
    async fn refused_connection_is_a_dial_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let replayer = Replayer::new(&ReplayConfig::default()).unwrap();
        let request = Request::get(format!("http://127.0.0.1:{}/", port))
            .body(Bytes::new())
            .unwrap();
        let err = replayer.send(request, false).await.unwrap_err();
        assert!(matches!(err, AttackError::Dial { .. }));
    }
}
