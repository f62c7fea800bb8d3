use attack_engine::{
    AttackError, ReplayConfig, Replayer, RequestSender, ScanResult, VulnerabilityScanner,
};
use axum::{
    body::Body,
    extract::{rejection::PathRejection, rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use proxy_core::forwarder::strip_hop_by_hop;
use proxy_core::{record, ProxyError, RequestStore, StoredRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::OrchestratorError;

/// Message for missing or non-positive ids and page parameters.
pub const INVALID_FIELDS: &str = "required fields are missing or contain invalid data";

/// Application state shared across admin handlers
#[derive(Clone)]
pub struct AdminState {
    store: Arc<dyn RequestStore>,
    sender: Arc<dyn RequestSender>,
    scanner: VulnerabilityScanner,
}

impl AdminState {
    pub fn new(store: Arc<dyn RequestStore>, replay: &ReplayConfig) -> Result<Self, OrchestratorError> {
        let sender: Arc<dyn RequestSender> = Arc::new(Replayer::new(replay)?);
        Ok(Self::with_sender(store, sender))
    }

    pub fn with_sender(store: Arc<dyn RequestStore>, sender: Arc<dyn RequestSender>) -> Self {
        Self {
            store,
            scanner: VulnerabilityScanner::new(sender.clone()),
            sender,
        }
    }
}

/// JSON error body: `{"message": ...}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn invalid_fields() -> Self {
        Self::new(StatusCode::BAD_REQUEST, INVALID_FIELDS)
    }
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        Self::new(e.status_code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct RequestResponse {
    pub request: StoredRequest,
}

#[derive(Debug, Serialize)]
pub struct RequestsResponse {
    pub requests: Vec<StoredRequest>,
}

/// Query parameters for the request listing
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub start: i64,
    pub limit: Option<i64>,
    #[serde(default)]
    pub full: bool,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/requests", get(list_requests))
        .route("/request/:id", get(get_request))
        .route("/repeat/:id", get(repeat_request))
        .route("/scan/:id", get(scan_request))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn request_id(id: Result<Path<i64>, PathRejection>) -> Result<i64, ApiError> {
    match id {
        Ok(Path(id)) if id > 0 => Ok(id),
        _ => Err(ApiError::invalid_fields()),
    }
}

/// Load a stored request and rebuild it as a live request.
async fn load_request(
    state: &AdminState,
    id: i64,
) -> Result<(http::Request<Bytes>, bool), ApiError> {
    let stored = state.store.get(id).await?;
    let record = stored.record()?;
    let request = record::decode(&record, stored.is_https).map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("can't parse request: {}", e),
        )
    })?;
    Ok((request, stored.is_https))
}

async fn get_request(
    State(state): State<AdminState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<RequestResponse>, ApiError> {
    let id = request_id(id)?;
    let request = state.store.get(id).await?;
    Ok(Json(RequestResponse { request }))
}

async fn list_requests(
    State(state): State<AdminState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<RequestsResponse>, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::invalid_fields())?;
    let limit = match query.limit {
        Some(limit) if limit > 0 && query.start >= 0 => limit,
        _ => return Err(ApiError::invalid_fields()),
    };

    let requests = state.store.list(query.start, limit, query.full).await?;
    Ok(Json(RequestsResponse { requests }))
}

async fn repeat_request(
    State(state): State<AdminState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let id = request_id(id)?;
    let (request, is_https) = load_request(&state, id).await?;
    info!(id, "Repeating {} {}", request.method(), request.uri());

    let replayed = state.sender.send(request, is_https).await.map_err(|e| {
        warn!(id, error = %e, "Repeat failed");
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    Ok(mirror_response(replayed.status, replayed.headers, replayed.body))
}

/// Copy an origin response, dropping `Location` and framing headers.
fn mirror_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut headers = strip_hop_by_hop(headers);
    headers.remove(header::LOCATION);
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

async fn scan_request(
    State(state): State<AdminState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ScanResult>, ApiError> {
    let id = request_id(id)?;
    let (request, is_https) = load_request(&state, id).await?;
    info!(id, "Scanning {} {}", request.method(), request.uri());

    let result = state
        .scanner
        .scan(request, is_https)
        .await
        .map_err(|e: AttackError| {
            warn!(id, error = %e, "Scan failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn mirrored_response_drops_location() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/login"));
        headers.insert("x-origin", HeaderValue::from_static("stub"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let response = mirror_response(StatusCode::FOUND, headers, Bytes::from_static(b"moved"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(response.headers().get(header::LOCATION).is_none());
        assert!(response.headers().get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(response.headers()["x-origin"], "stub");
    }

    #[test]
    fn store_errors_keep_their_status() {
        let err = ApiError::from(ProxyError::NotFound(7));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "Request 7 not found");
    }
}
