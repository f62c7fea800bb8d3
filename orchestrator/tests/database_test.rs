use bytes::Bytes;
use orchestrator::{DatabaseConfig, SqliteRequestStore};
use proxy_core::{record, NewRequest, ProxyError, RequestStore};
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> SqliteRequestStore {
    let config = DatabaseConfig {
        url: format!("sqlite:{}", dir.path().join("requests.db").display()),
        max_connections: 5,
    };
    SqliteRequestStore::connect(&config)
        .await
        .expect("Failed to create DB")
}

fn new_request(uri: &str, body: &'static [u8], is_https: bool) -> NewRequest {
    let request = http::Request::post(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Bytes::from_static(body))
        .unwrap();
    let record = record::encode(&request, None).unwrap();
    NewRequest::from_record(&record, is_https).unwrap()
}

#[tokio::test]
async fn test_save_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let first = store
        .save(new_request("http://shop.test/login?next=%2F", b"user=bob&pass=x", false))
        .await
        .unwrap();
    let second = store
        .save(new_request("https://bank.test/transfer", b"to=alice", true))
        .await
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    let stored = store.get(first).await.unwrap();
    assert_eq!(stored.id, 1);
    assert!(!stored.is_https);
    assert_eq!(stored.path, "http://shop.test/login?next=%2F");
    let record = stored.request.expect("get decodes the record");
    assert_eq!(record.method, "POST");
    assert_eq!(record.body, b"user=bob&pass=x");
    assert_eq!(record.post_form, "pass=x&user=bob");

    assert!(store.get(second).await.unwrap().is_https);
}

#[tokio::test]
async fn test_missing_request_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    assert!(matches!(store.get(42).await, Err(ProxyError::NotFound(42))));
}

#[tokio::test]
async fn test_list_pages_in_id_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    for i in 0..5 {
        store
            .save(new_request(&format!("http://shop.test/item/{}", i), b"", false))
            .await
            .unwrap();
    }

    let page = store.list(1, 2, false).await.unwrap();
    let ids: Vec<i64> = page.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3]);
    assert!(page.iter().all(|r| r.request.is_none()));

    let full = store.list(0, 10, true).await.unwrap();
    assert_eq!(full.len(), 5);
    assert!(full.iter().all(|r| r.request.is_some()));

    assert!(store.list(10, 10, false).await.unwrap().is_empty());
    assert!(store.list(0, 0, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_all_restarts_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store.save(new_request("http://a.test/", b"", false)).await.unwrap();
    store.save(new_request("http://b.test/", b"", false)).await.unwrap();

    store.delete_all().await.unwrap();
    assert!(store.list(0, 10, false).await.unwrap().is_empty());

    let id = store.save(new_request("http://c.test/", b"", false)).await.unwrap();
    assert_eq!(id, 1);
}

#[tokio::test]
async fn test_rows_survive_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open_store(&dir).await;
        store.save(new_request("http://a.test/", b"", false)).await.unwrap();
        store.pool().close().await;
    }
    let store = open_store(&dir).await;
    assert_eq!(store.list(0, 10, false).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_in_memory_database() {
    let store = SqliteRequestStore::connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 5,
    })
    .await
    .unwrap();
    let id = store.save(new_request("http://a.test/", b"", false)).await.unwrap();
    assert_eq!(store.get(id).await.unwrap().path, "http://a.test/");
}
