//! Filtering, logging and hand-off of captured requests to the store.

use crate::config::CaptureConfig;
use crate::record::{self, RequestRecord};
use crate::store::{NewRequest, RequestStore};
use crate::Result;
use bytes::Bytes;
use http::Request;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const TRIMMED_SUFFIX: &str = "...(trimmed)";

/// Shared by the proxy paths: decides which requests are persisted and writes
/// the request log line.
#[derive(Clone)]
pub struct CapturePipeline {
    store: Arc<dyn RequestStore>,
    config: CaptureConfig,
}

impl CapturePipeline {
    pub fn new(store: Arc<dyn RequestStore>, config: CaptureConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn tunnel_capture_limit(&self) -> usize {
        self.config.max_tunnel_capture
    }

    /// Record a request whose body is already buffered. Encoding failures
    /// are logged and never reach the caller.
    pub fn capture_request(
        &self,
        req: &Request<Bytes>,
        is_https: bool,
        remote_addr: Option<SocketAddr>,
    ) -> Option<JoinHandle<Option<i64>>> {
        match record::encode(req, remote_addr) {
            Ok(record) => Some(self.submit(record, is_https)),
            Err(e) => {
                error!(error = %e, uri = %req.uri(), "Can't convert request to model");
                None
            }
        }
    }

    /// Record every request found in a raw client byte stream.
    pub fn capture_raw(
        &self,
        data: &[u8],
        is_https: bool,
        remote_addr: Option<SocketAddr>,
    ) -> Vec<JoinHandle<Option<i64>>> {
        let requests = record::parse_requests(data);
        if requests.is_empty() && !data.is_empty() {
            debug!(bytes = data.len(), "No parsable request in captured stream");
        }

        requests
            .iter()
            .filter_map(|req| self.capture_request(req, is_https, remote_addr))
            .collect()
    }

    /// Persist `record` in the background if the method filter allows it.
    ///
    /// The handle resolves to the stored id, or `None` when the request was
    /// filtered out or saving failed.
    pub fn submit(&self, record: RequestRecord, is_https: bool) -> JoinHandle<Option<i64>> {
        let head = request_head(&record, self.config.max_uri_length);
        let persist = record
            .method
            .parse::<http::Method>()
            .map(|method| self.config.method_filter.matches(&method))
            .unwrap_or(false);

        if !persist {
            info!("{}", head);
            return tokio::spawn(async { None });
        }

        let store = self.store.clone();
        tokio::spawn(async move {
            let row = match NewRequest::from_record(&record, is_https) {
                Ok(row) => row,
                Err(e) => {
                    error!(error = %e, "Can't save request");
                    info!("{}", head);
                    return None;
                }
            };
            match store.save(row).await {
                Ok(id) => {
                    info!(id, "{}", head);
                    Some(id)
                }
                Err(e) => {
                    error!(error = %e, "Can't save request");
                    info!("{}", head);
                    None
                }
            }
        })
    }
}

/// `Method: GET HTTP/1.1\t Request: /path`, with long URIs trimmed.
pub fn request_head(record: &RequestRecord, max_uri_length: usize) -> String {
    format!(
        "Method: {} {}\t Request: {}",
        record.method,
        record.proto,
        trim_uri(&record.request_uri, max_uri_length)
    )
}

pub fn trim_uri(uri: &str, max_len: usize) -> String {
    if uri.len() <= max_len {
        return uri.to_string();
    }
    let mut cut = max_len;
    while !uri.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &uri[..cut], TRIMMED_SUFFIX)
}
