//! Command-injection scanner.
//!
//! A scan first replays the request unchanged to check the origin answers.
//! It then sweeps every payload through each query parameter and through
//! each `=` boundary of the body. A response is considered vulnerable when
//! it has status 200 and its (possibly gunzipped) body contains the marker.

use crate::error::{AttackError, AttackResult};
use crate::mutation::{body_fragments, mutate_body, mutate_query, parse_query};
use crate::payload::{contains_marker, payload_list, PAYLOADS};
use crate::replayer::{ReplayResponse, RequestSender};
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, StatusCode, Uri};
use proxy_core::ProxyError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VULNERABLE_BY_QUERY: &str = "vulnerable by query";
pub const NO_QUERY_PARAMS: &str = "no query params";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    #[serde(rename = "OK")]
    Ok,
    NotFound,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(rename = "scan_status")]
    pub status: ScanStatus,
    #[serde(rename = "scan_query", default)]
    pub query: String,
    #[serde(rename = "scan_body", default)]
    pub body: String,
    #[serde(rename = "used_attack_vectors")]
    pub payloads: Vec<String>,
}

impl ScanResult {
    fn unavailable() -> Self {
        Self {
            status: ScanStatus::Unavailable,
            query: String::new(),
            body: String::new(),
            payloads: payload_list(),
        }
    }
}

enum QueryOutcome {
    NoParams,
    Clean,
    Vulnerable,
}

enum BodyFinding {
    TimedOut(String),
    Reflected(String),
}

impl BodyFinding {
    fn message(&self) -> String {
        match self {
            Self::TimedOut(fragment) => {
                format!("time-based vulnerable by body (found in {})", fragment)
            }
            Self::Reflected(fragment) => format!("vulnerable by body (found in {})", fragment),
        }
    }
}

#[derive(Clone)]
pub struct VulnerabilityScanner {
    sender: Arc<dyn RequestSender>,
}

impl VulnerabilityScanner {
    pub fn new(sender: Arc<dyn RequestSender>) -> Self {
        Self { sender }
    }

    /// Scan a decoded request. The request URI must be absolute.
    pub async fn scan(&self, request: Request<Bytes>, is_https: bool) -> AttackResult<ScanResult> {
        let target = request.uri().to_string();
        let gzipped = match self.probe(&request, is_https).await {
            Some(gzipped) => gzipped,
            None => {
                info!("Scan of {} skipped: origin unavailable", target);
                return Ok(ScanResult::unavailable());
            }
        };

        let query = self.sweep_query(&request, is_https, gzipped).await?;
        let body = self.sweep_body(&request, is_https, gzipped).await?;

        let query = match query {
            QueryOutcome::NoParams => NO_QUERY_PARAMS.to_string(),
            QueryOutcome::Clean => String::new(),
            QueryOutcome::Vulnerable => VULNERABLE_BY_QUERY.to_string(),
        };
        let body = body.as_ref().map(BodyFinding::message).unwrap_or_default();
        // Any message on either side, including the no-params note, reports OK.
        let status = if query.is_empty() && body.is_empty() {
            ScanStatus::NotFound
        } else {
            ScanStatus::Ok
        };
        let result = ScanResult {
            status,
            query,
            body,
            payloads: payload_list(),
        };
        info!(status = ?result.status, "Scan of {} finished", target);
        Ok(result)
    }

    /// Replay the request unchanged. Returns whether the origin gzips, or
    /// `None` when it failed or answered outside 200..=202.
    async fn probe(&self, request: &Request<Bytes>, is_https: bool) -> Option<bool> {
        match self.sender.send(clone_request(request), is_https).await {
            Ok(resp) if (200..=202).contains(&resp.status.as_u16()) => Some(resp.is_gzip()),
            Ok(resp) => {
                debug!("Probe answered {}", resp.status);
                None
            }
            Err(e) => {
                debug!("Probe failed: {}", e);
                None
            }
        }
    }

    async fn sweep_query(
        &self,
        request: &Request<Bytes>,
        is_https: bool,
        gzipped: bool,
    ) -> AttackResult<QueryOutcome> {
        let params = parse_query(request.uri().query().unwrap_or(""));
        if params.is_empty() {
            return Ok(QueryOutcome::NoParams);
        }

        for payload in PAYLOADS {
            for key in params.keys() {
                let uri = with_query(request.uri(), &mutate_query(&params, key, payload))?;
                let mut trial = clone_request(request);
                *trial.uri_mut() = uri;

                match self.sender.send(trial, is_https).await {
                    Ok(resp) if is_reflected(&resp, gzipped) => {
                        info!("Query parameter {} is injectable", key);
                        return Ok(QueryOutcome::Vulnerable);
                    }
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {
                        warn!("Query trial on {} timed out, treating as inconclusive", key);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(QueryOutcome::Clean)
    }

    async fn sweep_body(
        &self,
        request: &Request<Bytes>,
        is_https: bool,
        gzipped: bool,
    ) -> AttackResult<Option<BodyFinding>> {
        let text = String::from_utf8_lossy(request.body()).into_owned();
        let fragments = body_fragments(&text);
        let mut finding: Option<BodyFinding> = None;

        for payload in PAYLOADS {
            for index in 0..fragments.len().saturating_sub(1) {
                let body = mutate_body(&fragments, index, payload);
                let mut trial = clone_request(request);
                trial
                    .headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
                *trial.body_mut() = Bytes::from(body);

                match self.sender.send(trial, is_https).await {
                    Ok(resp) if is_reflected(&resp, gzipped) => {
                        info!("Body fragment {} is injectable", fragments[index]);
                        finding = Some(BodyFinding::Reflected(fragments[index].to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {
                        warn!("Body trial after {} timed out", fragments[index]);
                        if finding.is_none() {
                            finding = Some(BodyFinding::TimedOut(fragments[index].to_string()));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            if finding.is_some() {
                break;
            }
        }
        Ok(finding)
    }
}

fn is_reflected(resp: &ReplayResponse, gzipped: bool) -> bool {
    if resp.status != StatusCode::OK {
        return false;
    }
    match resp.decoded_body(gzipped) {
        Ok(body) => contains_marker(&body),
        Err(e) => {
            debug!("Ignoring undecodable trial response: {}", e);
            false
        }
    }
}

fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

fn with_query(uri: &Uri, query: &str) -> AttackResult<Uri> {
    let path_and_query: PathAndQuery = format!("{}?{}", uri.path(), query)
        .parse()
        .map_err(|e| ProxyError::Decode(format!("query for {}: {}", uri, e)))?;
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts)
        .map_err(|e| AttackError::from(ProxyError::Decode(format!("uri {}: {}", uri, e))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replayer::{ReplayConfig, Replayer};
    use async_trait::async_trait;
    use axum::extract::{Query, RawQuery};
    use axum::routing::{get, post};
    use axum::Router;
    use http::HeaderMap;
    use std::collections::HashMap;
    use std::sync::Mutex;

    async fn serve(app: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn scanner() -> VulnerabilityScanner {
        VulnerabilityScanner::new(Arc::new(Replayer::new(&ReplayConfig::default()).unwrap()))
    }

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n";

    #[tokio::test]
    async fn query_injection_is_reported() {
        let app = Router::new().route(
            "/ping",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                match q.get("host") {
                    Some(host) if host.contains("cat /etc/passwd") => PASSWD.to_string(),
                    _ => "pong".to_string(),
                }
            }),
        );
        let addr = serve(app).await;

        let request = Request::get(format!("http://{}/ping?host=127.0.0.1&count=1", addr))
            .body(Bytes::new())
            .unwrap();
        let result = scanner().scan(request, false).await.unwrap();
        assert_eq!(result.status, ScanStatus::Ok);
        assert_eq!(result.query, VULNERABLE_BY_QUERY);
        assert_eq!(result.body, "");
        assert_eq!(result.payloads.len(), 4);
    }

    #[tokio::test]
    async fn body_injection_names_the_fragment() {
        let app = Router::new().route(
            "/form",
            post(|body: String| async move {
                // Only the value of `b` reaches the shell.
                let b = body.split('&').find_map(|kv| kv.strip_prefix("b="));
                match b {
                    Some(value) if value.contains("cat /etc/passwd") => PASSWD.to_string(),
                    _ => "ok".to_string(),
                }
            }),
        );
        let addr = serve(app).await;

        let request = Request::post(format!("http://{}/form", addr))
            .header("content-type", "application/x-www-form-urlencoded")
            .header("content-length", "7")
            .body(Bytes::from_static(b"a=1&b=2"))
            .unwrap();
        let result = scanner().scan(request, false).await.unwrap();
        assert_eq!(result.status, ScanStatus::Ok);
        assert_eq!(result.query, NO_QUERY_PARAMS);
        assert_eq!(result.body, "vulnerable by body (found in 1&b)");
    }

    #[tokio::test]
    async fn clean_origin_is_not_found() {
        let app = Router::new().route(
            "/search",
            get(|RawQuery(q): RawQuery| async move { format!("results for {:?}", q) }),
        );
        let addr = serve(app).await;

        let request = Request::get(format!("http://{}/search?q=shoes", addr))
            .body(Bytes::new())
            .unwrap();
        let result = scanner().scan(request, false).await.unwrap();
        assert_eq!(result.status, ScanStatus::NotFound);
        assert_eq!(result.query, "");
        assert_eq!(result.body, "");
    }

    #[tokio::test]
    async fn failing_origin_is_unavailable() {
        let app = Router::new().route(
            "/",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, PASSWD) }),
        );
        let addr = serve(app).await;

        let request = Request::get(format!("http://{}/?x=1", addr))
            .body(Bytes::new())
            .unwrap();
        let result = scanner().scan(request, false).await.unwrap();
        assert_eq!(result.status, ScanStatus::Unavailable);
        assert_eq!(result.payloads, payload_list());
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let result = ScanResult {
            status: ScanStatus::Ok,
            query: VULNERABLE_BY_QUERY.to_string(),
            body: String::new(),
            payloads: vec![";cat /etc/passwd;".to_string()],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scan_status"], "OK");
        assert_eq!(json["scan_query"], "vulnerable by query");
        assert_eq!(json["scan_body"], "");
        assert_eq!(json["used_attack_vectors"][0], ";cat /etc/passwd;");
        assert_eq!(
            serde_json::to_value(ScanStatus::Unavailable).unwrap(),
            "Unavailable"
        );
    }

    /// Sender scripted by the body it receives.
    struct ScriptedSender {
        seen: Mutex<Vec<String>>,
        respond: fn(&str) -> AttackResult<ReplayResponse>,
    }

    #[async_trait]
    impl RequestSender for ScriptedSender {
        async fn send(&self, request: Request<Bytes>, _: bool) -> AttackResult<ReplayResponse> {
            let body = String::from_utf8_lossy(request.body()).into_owned();
            self.seen.lock().unwrap().push(body.clone());
            (self.respond)(&body)
        }
    }

    fn ok(body: &'static str) -> AttackResult<ReplayResponse> {
        Ok(ReplayResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    fn timed_out() -> AttackResult<ReplayResponse> {
        Err(AttackError::Timeout {
            operation: "replay".into(),
            duration_ms: 2000,
        })
    }

    fn scripted(respond: fn(&str) -> AttackResult<ReplayResponse>) -> Arc<ScriptedSender> {
        Arc::new(ScriptedSender {
            seen: Mutex::new(Vec::new()),
            respond,
        })
    }

    fn form_request(body: &'static str) -> Request<Bytes> {
        Request::post("https://shop.test/checkout")
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    #[tokio::test]
    async fn body_timeout_is_reported_as_time_based() {
        let sender = scripted(|body| {
            if body.contains("ping") && body.starts_with("a=1||") {
                timed_out()
            } else {
                ok("fine")
            }
        });
        let scanner = VulnerabilityScanner::new(sender.clone());
        let result = scanner.scan(form_request("a=1&b=2"), true).await.unwrap();
        assert_eq!(result.status, ScanStatus::Ok);
        assert_eq!(result.body, "time-based vulnerable by body (found in a)");
    }

    #[tokio::test]
    async fn later_reflection_overrides_timeout() {
        let sender = scripted(|body| {
            if body == "a=1;cat /etc/passwd;&b=2" {
                timed_out()
            } else if body == "a=1&b=2;cat /etc/passwd;" {
                ok("root:x:0:0")
            } else {
                ok("fine")
            }
        });
        let scanner = VulnerabilityScanner::new(sender.clone());
        let result = scanner.scan(form_request("a=1&b=2"), true).await.unwrap();
        assert_eq!(result.body, "vulnerable by body (found in 1&b)");

        // Probe plus the two trials of the first payload; the sweep stops there.
        assert_eq!(sender.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hard_failure_aborts_the_scan() {
        let sender = scripted(|body| {
            if body == "a=1&b=2" {
                ok("fine")
            } else {
                Err(AttackError::Transport {
                    details: "connection reset".into(),
                })
            }
        });
        let scanner = VulnerabilityScanner::new(sender);
        let err = scanner.scan(form_request("a=1&b=2"), true).await.unwrap_err();
        assert!(matches!(err, AttackError::Transport { .. }));
    }

    #[tokio::test]
    async fn body_without_equals_is_not_swept() {
        let sender = scripted(|_| ok("fine"));
        let scanner = VulnerabilityScanner::new(sender.clone());
        let result = scanner.scan(form_request("plain"), true).await.unwrap();
        assert_eq!(result.query, NO_QUERY_PARAMS);
        assert_eq!(result.body, "");
        assert_eq!(result.status, ScanStatus::Ok);
        assert_eq!(sender.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_query_params_report_ok_with_clean_body() {
        let sender = scripted(|_| ok("fine"));
        let scanner = VulnerabilityScanner::new(sender.clone());
        let result = scanner.scan(form_request("a=1"), true).await.unwrap();
        assert_eq!(result.query, NO_QUERY_PARAMS);
        assert_eq!(result.body, "");
        assert_eq!(result.status, ScanStatus::Ok);
        // Probe plus one body trial per payload.
        assert_eq!(sender.seen.lock().unwrap().len(), 1 + PAYLOADS.len());
    }

    /// Records the target of every request it is given.
    struct UriRecorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestSender for UriRecorder {
        async fn send(&self, request: Request<Bytes>, _: bool) -> AttackResult<ReplayResponse> {
            let uri = request.uri().to_string();
            self.seen.lock().unwrap().push(uri.clone());
            if uri.contains("cat+%2Fetc%2Fpasswd") {
                ok("root:x:0:0")
            } else {
                ok("fine")
            }
        }
    }

    #[tokio::test]
    async fn query_sweep_stops_at_first_match() {
        let sender = Arc::new(UriRecorder {
            seen: Mutex::new(Vec::new()),
        });
        let scanner = VulnerabilityScanner::new(sender.clone());
        let request = Request::get("https://shop.test/ping?host=a&zone=b")
            .body(Bytes::new())
            .unwrap();

        let result = scanner.scan(request, true).await.unwrap();
        assert_eq!(result.status, ScanStatus::Ok);
        assert_eq!(result.query, VULNERABLE_BY_QUERY);
        assert_eq!(result.body, "");

        // Probe plus the first trial (first payload on `host`); the empty
        // body never reaches the body sweep.
        let seen = sender.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "https://shop.test/ping?host=a&zone=b");
        assert!(seen[1].contains("host=a"));
        assert!(seen[1].contains("zone=b"));
    }

    #[test]
    fn query_replacement_keeps_scheme_and_path() {
        let uri: Uri = "https://shop.test:8443/a/b?x=1".parse().unwrap();
        let replaced = with_query(&uri, "x=2").unwrap();
        assert_eq!(replaced.to_string(), "https://shop.test:8443/a/b?x=2");
    }
}
