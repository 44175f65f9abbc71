//! SQLite storage backend for satindex.
//!
//! Stores the whole key space in one `kv` table keyed by BLOB. SQLite
//! compares BLOBs with `memcmp`, so prefix and range scans are plain
//! `key >= ? AND key < ?` queries over the primary key. Uses `sqlx` with
//! WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use satindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./satindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use satindex_core::error::IndexerError;
use satindex_core::store::{prefix_successor, KvOp, KvPairs, PersistentStore};

/// SQLite-backed ordered key-value store.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./satindex.db"`) or a full
    /// SQLite URL (`"sqlite:./satindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is capped at one connection. All data is lost when the pool is
    /// dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create the table and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB NOT NULL PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of stored keys.
    pub async fn key_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    async fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<KvPairs, IndexerError> {
        let rows = match end {
            Some(end) => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key")
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ? ORDER BY key")
                    .bind(start)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Vec<u8>, _>("key"), r.get::<Vec<u8>, _>("value")))
            .collect())
    }
}

// ─── PersistentStore impl ────────────────────────────────────────────────────

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), IndexerError> {
        sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<KvOp>) -> Result<(), IndexerError> {
        let count = ops.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for op in ops {
            match op {
                KvOp::Put { key, value } => {
                    sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                KvOp::Delete { key } => {
                    sqlx::query("DELETE FROM kv WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }
        tx.commit().await.map_err(storage_err)?;
        debug!(ops = count, "batch committed");
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &[u8]) -> Result<KvPairs, IndexerError> {
        let end = prefix_successor(prefix);
        self.scan(prefix, end.as_deref()).await
    }

    async fn iterate_range(&self, start: &[u8], end: &[u8]) -> Result<KvPairs, IndexerError> {
        if start >= end {
            return Ok(Vec::new());
        }
        self.scan(start, Some(end)).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
