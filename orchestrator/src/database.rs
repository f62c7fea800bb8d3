use crate::settings::DatabaseConfig;
use crate::OrchestratorError;
use async_trait::async_trait;
use proxy_core::{NewRequest, ProxyError, RequestStore, StoredRequest};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;

/// Request store backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteRequestStore {
    pool: Pool<Sqlite>,
}

impl SqliteRequestStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, OrchestratorError> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        // Every connection to an in-memory database gets its own database.
        let max_connections = if config.url.contains(":memory:") {
            1
        } else {
            config.max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Database initialized and migrated at {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn store_error(e: sqlx::Error) -> ProxyError {
    ProxyError::Store(e.to_string())
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredRequest, ProxyError> {
    Ok(StoredRequest {
        id: row.try_get("id").map_err(store_error)?,
        is_https: row.try_get("is_https").map_err(store_error)?,
        path: row.try_get("uri").map_err(store_error)?,
        data: row.try_get("data").map_err(store_error)?,
        request: None,
    })
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn save(&self, request: NewRequest) -> proxy_core::Result<i64> {
        let result = sqlx::query("INSERT INTO requests (is_https, uri, data) VALUES (?, ?, ?)")
            .bind(request.is_https)
            .bind(&request.path)
            .bind(&request.data)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> proxy_core::Result<StoredRequest> {
        let row = sqlx::query("SELECT id, is_https, uri, data FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or(ProxyError::NotFound(id))?;
        stored_from_row(&row)?.with_record()
    }

    async fn list(
        &self,
        offset: i64,
        limit: i64,
        include_body: bool,
    ) -> proxy_core::Result<Vec<StoredRequest>> {
        if offset < 0 || limit <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, is_https, uri, data FROM requests ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter()
            .map(|row| {
                let stored = stored_from_row(row)?;
                if include_body {
                    stored.with_record()
                } else {
                    Ok(stored)
                }
            })
            .collect()
    }

    async fn delete_all(&self) -> proxy_core::Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("DELETE FROM requests")
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        // Restart ids at 1 for the next session.
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'requests'")
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        info!("Cleared all stored requests");
        Ok(())
    }
}
