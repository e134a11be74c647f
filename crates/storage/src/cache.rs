//! SQLite-backed key/value cache with expiry.

use crate::{Error, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Default number of entries kept before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Persistent cache of string values keyed by content hash.
///
/// Entries expire after their TTL (if any) and the store never holds more
/// than `capacity` rows; on overflow the least recently written rows go.
pub struct CacheStore {
    conn: Mutex<Connection>,
    capacity: usize,
}

impl CacheStore {
    /// Open or create a cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory cache (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            capacity: DEFAULT_CAPACITY,
        })
    }

    /// Set the maximum number of entries.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM cache
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Insert or replace an entry, evicting the oldest rows past capacity.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_add(ttl_ms)
        });
        let capacity = i64::try_from(self.capacity).unwrap_or(i64::MAX);

        let conn = self.conn()?;
        // REPLACE assigns a fresh rowid, so rowid order is write order.
        conn.execute(
            "INSERT OR REPLACE INTO cache (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        let excess = count - capacity;
        if excess > 0 {
            conn.execute(
                "DELETE FROM cache WHERE rowid IN (
                    SELECT rowid FROM cache ORDER BY rowid ASC LIMIT ?1
                 )",
                params![excess],
            )?;
        }
        Ok(())
    }

    /// Drop one entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM cache WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Delete every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let removed = self.conn()?.execute(
            "DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }

    /// Number of stored rows, expired or not.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
