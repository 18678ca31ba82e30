//! SQLite-backed session cache, shared by every process pointed at the
//! same database file.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use super::store::SessionCache;
use crate::core::errors::ApiError;

pub struct SqliteSessionCache {
    pool: SqlitePool,
}

impl SqliteSessionCache {
    pub async fn with_path(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ApiError::store(format!("Failed to connect to history db: {}", e)))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ApiError::store(format!("Failed to init session_cache table: {}", e)))?;

        tracing::info!(path = %db_path.display(), "Session history database ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionCache for SqliteSessionCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, ApiError> {
        sqlx::query_scalar("SELECT value FROM session_cache WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(ApiError::store)
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<(), ApiError> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO session_cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(ApiError::store)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ApiError> {
        sqlx::query("DELETE FROM session_cache WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(ApiError::store)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_cache() -> SqliteSessionCache {
        let tmp = std::env::temp_dir().join(format!(
            "blinkchat-history-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        SqliteSessionCache::with_path(tmp).await.unwrap()
    }

    #[tokio::test]
    async fn set_overwrites_and_remove_is_idempotent() {
        let cache = test_cache().await;

        assert_eq!(cache.get_raw("s1").await.unwrap(), None);

        cache.set_raw("s1", "[]").await.unwrap();
        cache.set_raw("s1", r#"[{"Role":"User","Content":"hi"}]"#).await.unwrap();
        assert_eq!(
            cache.get_raw("s1").await.unwrap().as_deref(),
            Some(r#"[{"Role":"User","Content":"hi"}]"#)
        );

        cache.remove("s1").await.unwrap();
        cache.remove("s1").await.unwrap();
        assert_eq!(cache.get_raw("s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_pool_reports_store_unavailable() {
        let cache = test_cache().await;
        cache.pool.close().await;

        let err = cache.get_raw("s1").await.unwrap_err();
        assert!(matches!(err, ApiError::StoreUnavailable(_)));
    }
}
