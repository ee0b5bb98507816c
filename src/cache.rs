//! Persistent key/value cache with per-entry expiry.
//!
//! Every networked read goes through a [`Cache`]. Two implementations
//! share the contract: [`SqliteCache`] persists entries in a single SQLite
//! file, and [`NoopCache`] never stores anything so caching can be turned
//! off without touching callers.
//!
//! Reads never return expired rows. An expired row found by
//! [`Cache::get`] is deleted on the spot, and [`load`] additionally
//! deletes rows that fail to deserialize or validate, so a damaged cache
//! heals itself instead of serving bad data.

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::types::{Analysis, CheckStatus, DiffStats, PrKey, PullRequest, Review};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache {operation} failed: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("cache is closed")]
    Closed,
}

impl CacheError {
    fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        CacheError::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// Storage contract shared by all cache implementations. All methods are
/// safe to call concurrently.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the stored bytes, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores `value` for `ttl`. A zero `ttl` stores nothing and removes
    /// any existing entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Removes every expired entry and returns how many were removed.
    async fn cleanup(&self) -> Result<usize, CacheError>;

    async fn close(&self) -> Result<(), CacheError>;
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        key        TEXT PRIMARY KEY,
        value      BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);
"#;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// SQLite-backed cache.
///
/// The connection sits behind a mutex and every statement runs on
/// `spawn_blocking`, so the cache can be shared freely across tasks.
pub struct SqliteCache {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteCache {
    /// Opens (creating if needed) the cache file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::storage("create directory", format!("{}: {e}", parent.display()))
                })?;
            }
        }

        let conn =
            Connection::open(path).map_err(|e| CacheError::storage("open", e.to_string()))?;
        // WAL keeps readers from blocking the writer; the busy timeout
        // covers a second process sharing the file.
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(|e| CacheError::storage("configure journal_mode", e.to_string()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CacheError::storage("open", e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|e| CacheError::storage("configure pragmas", e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CacheError::storage("create schema", e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| CacheError::storage(operation, "connection lock poisoned"))?;
            let conn = guard.as_ref().ok_or(CacheError::Closed)?;
            f(conn).map_err(|e| CacheError::storage(operation, e.to_string()))
        })
        .await
        .map_err(|e| CacheError::storage(operation, e.to_string()))?
    }

    /// Whether a row for `key` is physically stored, expired or not.
    pub async fn row_exists(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        self.run("inspect", move |conn| {
            conn.query_row(
                "SELECT 1 FROM cache_entries WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    /// Number of stored rows, expired or not.
    pub async fn len(&self) -> Result<usize, CacheError> {
        self.run("count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
        .await
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = key.to_string();
        self.run("get", move |conn| {
            let row: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((_, expires_at)) if expires_at <= now_millis() => {
                    conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                    Ok(None)
                }
                Some((value, _)) => Ok(Some(value)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return self.delete(key).await;
        }

        let key = key.to_string();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.run("set", move |conn| {
            let created_at = now_millis();
            conn.execute(
                "INSERT INTO cache_entries (key, value, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at",
                params![key, value, created_at, created_at.saturating_add(ttl_millis)],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.run("delete", move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn cleanup(&self) -> Result<usize, CacheError> {
        let removed = self
            .run("cleanup", |conn| {
                let removed = conn.execute(
                    "DELETE FROM cache_entries WHERE expires_at <= ?1",
                    params![now_millis()],
                )?;
                if removed > 0 {
                    conn.execute_batch("VACUUM")?;
                }
                Ok(removed)
            })
            .await?;
        debug!(removed, "Cache cleanup finished");
        Ok(removed)
    }

    async fn close(&self) -> Result<(), CacheError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CacheError::storage("close", "connection lock poisoned"))?;
            match guard.take() {
                Some(conn) => conn
                    .close()
                    .map_err(|(_, e)| CacheError::storage("close", e.to_string())),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| CacheError::storage("close", e.to_string()))?
    }
}

/// A value that can live in the cache.
///
/// `is_valid` lets a type reject a cached value that deserialized but is
/// not trustworthy; such entries are deleted and treated as a miss.
pub trait Cacheable: Serialize + DeserializeOwned {
    fn is_valid(&self) -> bool {
        true
    }
}

impl Cacheable for DiffStats {}

impl Cacheable for CheckStatus {
    fn is_valid(&self) -> bool {
        !self.description.trim().is_empty()
    }
}

impl Cacheable for Vec<Review> {}

impl Cacheable for Vec<PullRequest> {}

impl Cacheable for Analysis {
    fn is_valid(&self) -> bool {
        !self.risk_level.trim().is_empty()
    }
}

impl Cacheable for String {}

/// A commit-dependent value stamped with the head SHA it was read for.
///
/// A fetch that started before the PR moved to a new head may land after
/// the entry was invalidated; the stamp keeps that value from being served
/// for the new head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForCommit<T> {
    pub head_sha: String,
    pub value: T,
}

impl<T: Cacheable> Cacheable for ForCommit<T> {
    fn is_valid(&self) -> bool {
        self.value.is_valid()
    }
}

/// Reads and decodes `key`. Misses, storage failures and corrupt entries
/// all come back as `None`; corrupt entries are deleted.
pub async fn load<T: Cacheable>(cache: &dyn Cache, key: &str) -> Option<T> {
    let bytes = match cache.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            debug!(key, "Cache miss");
            return None;
        }
        Err(e) => {
            warn!(key, error = %e, "Cache read failed");
            return None;
        }
    };

    match serde_json::from_slice::<T>(&bytes) {
        Ok(value) if value.is_valid() => {
            debug!(key, "Cache hit");
            Some(value)
        }
        Ok(_) => {
            warn!(key, "Discarding invalid cache entry");
            evict(cache, key).await;
            None
        }
        Err(e) => {
            warn!(key, error = %e, "Discarding malformed cache entry");
            evict(cache, key).await;
            None
        }
    }
}

/// Encodes and stores `value`. Failures are logged, never returned.
pub async fn store<T: Cacheable>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key, error = %e, "Failed to encode cache entry");
            return;
        }
    };
    if let Err(e) = cache.set(key, bytes, ttl).await {
        warn!(key, error = %e, "Cache write failed");
    }
}

/// Deletes `key`, logging failures.
pub async fn evict(cache: &dyn Cache, key: &str) {
    if let Err(e) = cache.delete(key).await {
        warn!(key, error = %e, "Cache delete failed");
    }
}

/// Cache key families. Every key is a pure function of identity so the
/// same data always lands in the same row.
pub mod keys {
    use super::*;

    pub fn search(query: &str) -> String {
        format!("search:{query}")
    }

    pub fn diff_stats(pr: &PrKey) -> String {
        format!("diff:{pr}")
    }

    pub fn check_status(pr: &PrKey) -> String {
        format!("checks:{pr}")
    }

    pub fn reviews(pr: &PrKey) -> String {
        format!("reviews:{pr}")
    }

    /// Qualified by head SHA so a new commit misses without an explicit
    /// delete.
    pub fn analysis(pr: &PrKey, head_sha: &str) -> String {
        format!("ai:{pr}@{head_sha}")
    }

    /// Keyed by a hash of the tool's exact arguments.
    pub fn tool(tool: &str, args: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        hasher.update(args.to_string().as_bytes());
        format!("tool:{tool}:{}", hex::encode(hasher.finalize()))
    }
}
