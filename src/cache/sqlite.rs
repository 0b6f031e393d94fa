//! SQLite-backed shared cache
//!
//! Every instance that opens the same database file shares one set of
//! ownership records. Claims are single-writer-wins through the primary key:
//! the factory output is inserted with `ON CONFLICT DO NOTHING` and the row
//! that actually landed is read back, so a racing claimer from another
//! process always observes the winner rather than its own value.
//!
//! Expired rows (when an entry TTL is configured) are treated as absent and
//! deleted lazily by the next claimer. The delete is guarded on the expiry
//! column, so a live row written by a sibling in the meantime is never removed.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    ConnectOptions, Row,
};

use super::{CacheError, CacheOptions, SharedCache, ValueFactory};

/// SQLite [`SharedCache`]
pub struct SqliteCache {
    pool: SqlitePool,
    options: CacheOptions,
}

impl SqliteCache {
    /// Open (creating if needed) the cache database and run migrations
    pub async fn open(db_path: &Path, options: CacheOptions) -> Result<Self, CacheError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let mut connect_options: SqliteConnectOptions = db_url
            .parse()
            .map_err(|e| CacheError::Backend(format!("Failed to parse DB URL: {}", e)))?;
        connect_options.disable_statement_logging();

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(|e| CacheError::Backend(format!("Failed to connect: {}", e)))?;

        let cache = Self { pool, options };
        cache.run_migrations().await?;

        // Rows that expired while no instance was running
        let purged = cache.purge_expired().await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired session ownership entries");
        }
        Ok(cache)
    }

    async fn run_migrations(&self) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS affinity_cache (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_affinity_cache_expiry ON affinity_cache(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CacheError::Backend(format!("Migration failed: {}", e)))?;

        Ok(())
    }

    /// Delete every expired row, returning how many went away
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(
            "DELETE FROM affinity_cache WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row = sqlx::query(
            "SELECT value FROM affinity_cache WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn delete_expired(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query(
            "DELETE FROM affinity_cache WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SharedCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.read_live(key).await
    }

    async fn get_or_create(
        &self,
        key: &str,
        factory: ValueFactory<'_>,
    ) -> Result<Vec<u8>, CacheError> {
        if let Some(value) = self.read_live(key).await? {
            return Ok(value);
        }

        self.delete_expired(key).await?;

        let value = factory().await.map_err(CacheError::Factory)?;
        let now = Utc::now();
        let expires_at = self
            .options
            .entry_ttl
            .map(|ttl| now.timestamp_millis() + ttl.as_millis() as i64);

        sqlx::query(
            "INSERT INTO affinity_cache (key, value, created_at, expires_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(&value)
        .bind(now.timestamp_millis())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        // Whoever's row landed is the winner, which may not be ours
        match self.read_live(key).await? {
            Some(winner) => Ok(winner),
            None => Err(CacheError::Backend(format!(
                "Entry for '{}' vanished immediately after insert",
                key
            ))),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM affinity_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
