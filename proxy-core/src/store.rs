//! Request persistence contract and the in-process implementation.

use crate::error::ProxyError;
use crate::record::RequestRecord;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One stored request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRequest {
    pub id: i64,
    pub is_https: bool,
    /// Request target, kept as an indexed column
    pub path: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    /// Decoded record, present when the caller asked for the full request
    pub request: Option<RequestRecord>,
}

/// A request on its way into the store.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub is_https: bool,
    pub path: String,
    pub data: Vec<u8>,
}

impl NewRequest {
    pub fn from_record(record: &RequestRecord, is_https: bool) -> Result<Self> {
        Ok(Self {
            is_https,
            path: record.request_uri.clone(),
            data: record.to_blob()?,
        })
    }
}

impl StoredRequest {
    /// Decode the blob, keeping an already decoded record if present.
    pub fn record(&self) -> Result<RequestRecord> {
        match &self.request {
            Some(record) => Ok(record.clone()),
            None => RequestRecord::from_blob(&self.data),
        }
    }

    pub fn with_record(mut self) -> Result<Self> {
        if self.request.is_none() {
            self.request = Some(RequestRecord::from_blob(&self.data)?);
        }
        Ok(self)
    }
}

/// Storage backend for captured requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a request and return its id.
    async fn save(&self, request: NewRequest) -> Result<i64>;

    /// Fetch one request with its decoded record; `NotFound` if absent.
    async fn get(&self, id: i64) -> Result<StoredRequest>;

    /// Page through requests in id order.
    async fn list(&self, offset: i64, limit: i64, include_body: bool) -> Result<Vec<StoredRequest>>;

    /// Remove every stored request.
    async fn delete_all(&self) -> Result<()>;
}

/// Keeps requests in memory for the lifetime of the process.
#[derive(Default, Clone)]
pub struct MemoryRequestStore {
    inner: Arc<RwLock<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    rows: BTreeMap<i64, NewRequest>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rows.is_empty()
    }
}

fn to_stored(id: i64, row: &NewRequest) -> StoredRequest {
    StoredRequest {
        id,
        is_https: row.is_https,
        path: row.path.clone(),
        data: row.data.clone(),
        request: None,
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn save(&self, request: NewRequest) -> Result<i64> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.rows.insert(id, request);
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<StoredRequest> {
        let inner = self.inner.read().await;
        let row = inner.rows.get(&id).ok_or(ProxyError::NotFound(id))?;
        to_stored(id, row).with_record()
    }

    async fn list(&self, offset: i64, limit: i64, include_body: bool) -> Result<Vec<StoredRequest>> {
        if offset < 0 || limit <= 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        inner
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(id, row)| {
                let stored = to_stored(*id, row);
                if include_body {
                    stored.with_record()
                } else {
                    Ok(stored)
                }
            })
            .collect()
    }

    async fn delete_all(&self) -> Result<()> {
        self.inner.write().await.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use bytes::Bytes;
    use http::Request;

    fn sample(path: &str) -> NewRequest {
        let req = Request::builder()
            .uri(path)
            .header("host", "store.test")
            .body(Bytes::new())
            .unwrap();
        let record = record::encode(&req, None).unwrap();
        NewRequest::from_record(&record, true).unwrap()
    }

    #[tokio::test]
    async fn save_get_list_delete() {
        let store = MemoryRequestStore::new();
        let first = store.save(sample("/a")).await.unwrap();
        let second = store.save(sample("/b")).await.unwrap();
        assert!(second > first);

        let got = store.get(second).await.unwrap();
        assert_eq!(got.path, "/b");
        assert!(got.is_https);
        assert_eq!(got.request.unwrap().host, "store.test");

        let page = store.list(1, 10, false).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second);
        assert!(page[0].request.is_none());

        let full = store.list(0, 1, true).await.unwrap();
        assert_eq!(full.len(), 1);
        assert!(full[0].request.is_some());

        store.delete_all().await.unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(store.get(first).await, Err(ProxyError::NotFound(id)) if id == first));
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_purge() {
        let store = MemoryRequestStore::new();
        let before = store.save(sample("/a")).await.unwrap();
        store.delete_all().await.unwrap();
        let after = store.save(sample("/a")).await.unwrap();
        assert!(after > before);
    }
}
