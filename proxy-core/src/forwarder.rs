//! Passthrough for plain (non-CONNECT) proxy requests.

use crate::capture::CapturePipeline;
use crate::error::ProxyError;
use crate::Result;
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use std::fmt::Display;
use std::net::SocketAddr;
use tracing::{debug, error};

pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Headers that only apply to a single connection and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Captures a plain request, sends it to its absolute-URL target and streams
/// the answer back.
#[derive(Clone)]
pub struct PlainForwarder {
    client: reqwest::Client,
    pipeline: CapturePipeline,
    peer: Option<SocketAddr>,
}

impl PlainForwarder {
    pub fn new(pipeline: CapturePipeline) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::Configuration(format!("forwarding client: {}", e)))?;
        Ok(Self {
            client,
            pipeline,
            peer: None,
        })
    }

    /// Copy bound to one client connection.
    pub fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer: Some(peer),
            ..self.clone()
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body,
        B::Error: Display,
    {
        if req.method() == Method::CONNECT {
            // The connection already belongs to hyper and cannot become a tunnel.
            let err = ProxyError::HijackUnsupported;
            error!("{}", err);
            return text_response(err.status_code(), &err.to_string());
        }

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = ProxyError::BodyRead(e.to_string());
                return text_response(err.status_code(), &err.to_string());
            }
        };
        let req = Request::from_parts(parts, body);

        self.pipeline.capture_request(&req, false, self.peer);

        match self.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Upstream round trip failed");
                text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
            }
        }
    }

    async fn forward(&self, req: Request<Bytes>) -> Result<Response<ProxyBody>> {
        let url = absolute_url(&req)?;
        let (parts, body) = req.into_parts();

        let upstream = self
            .client
            .request(parts.method, url.to_string())
            .headers(strip_hop_by_hop(parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProxyError::Dial(e.to_string())
                } else {
                    ProxyError::Transport(e.to_string())
                }
            })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            *headers = strip_hop_by_hop(upstream.headers().clone());
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        response
            .body(BodyExt::boxed_unsync(StreamBody::new(stream)))
            .map_err(|e| ProxyError::Transport(e.to_string()))
    }
}

/// Absolute target of a proxied request; origin-form targets fall back to the
/// `Host` header.
fn absolute_url(req: &Request<Bytes>) -> Result<Uri> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::Decode(format!("no host for target {}", uri)))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{}{}", host, path)
        .parse()
        .map_err(|e| ProxyError::Decode(format!("target {}: {}", uri, e)))
}

pub fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
    headers
}

pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from(format!("{}\n", message)))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
