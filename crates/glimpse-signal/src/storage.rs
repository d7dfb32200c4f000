//! SQLite storage for the store server
//!
//! Persists session records and signaling queues so they survive a restart.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use glimpse_core::{KvStore, StoreError};

/// SQLite-backed [`KvStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        info!("Storage schema initialized");
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(value)
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, current_timestamp()],
        )?;

        Ok(())
    }

    pub fn delete_value(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Conditional write inside a transaction; see [`KvStore::compare_and_set`]
    pub fn swap_value(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        if current.as_deref() != expected {
            return Ok(false);
        }

        match value {
            Some(value) => tx.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, current_timestamp()],
            )?,
            None => tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?,
        };
        tx.commit()?;

        Ok(true)
    }

    /// Keys starting with `prefix`, in key order
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        // substr avoids LIKE wildcard escaping for '_' in key prefixes
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let keys: Vec<String> = stmt
            .query_map(params![prefix], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(keys)
    }

    /// Number of keys starting with `prefix`
    pub fn count_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_value(key)?)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.set_value(key, &value)?;
        debug!("Stored {}", key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        Ok(self.delete_value(key)?)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.keys_with_prefix(prefix)?)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<String>,
    ) -> Result<bool, StoreError> {
        Ok(self.swap_value(key, expected, value.as_deref())?)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    Database(rusqlite::Error),
    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        error!("Database error: {:?}", e);
        StorageError::Database(e)
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Database(e) => StoreError::Backend(e.to_string()),
            StorageError::LockPoisoned => StoreError::LockPoisoned,
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::LockPoisoned => {
                write!(f, "Lock poisoned: a thread panicked while holding the lock")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_creation() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.count_prefix("").unwrap(), 0);
    }

    #[test]
    fn test_value_operations() {
        let store = SqliteStore::in_memory().unwrap();

        store.set_value("glimpse_session_BA7ZUM4E", "{}").unwrap();
        assert_eq!(
            store.get_value("glimpse_session_BA7ZUM4E").unwrap(),
            Some("{}".into())
        );

        // Overwrite
        store.set_value("glimpse_session_BA7ZUM4E", "[1]").unwrap();
        assert_eq!(
            store.get_value("glimpse_session_BA7ZUM4E").unwrap(),
            Some("[1]".into())
        );
        assert_eq!(store.count_prefix("").unwrap(), 1);

        store.delete_value("glimpse_session_BA7ZUM4E").unwrap();
        assert!(store.get_value("glimpse_session_BA7ZUM4E").unwrap().is_none());
        store.delete_value("glimpse_session_BA7ZUM4E").unwrap();
    }

    #[test]
    fn test_prefix_is_literal() {
        let store = SqliteStore::in_memory().unwrap();
        store.set_value("glimpse_session_B", "x").unwrap();
        store.set_value("glimpse_session_A", "x").unwrap();
        // Would match "glimpse_session_%" if '_' were a wildcard
        store.set_value("glimpseXsessionXC", "x").unwrap();

        assert_eq!(
            store.keys_with_prefix("glimpse_session_").unwrap(),
            vec!["glimpse_session_A", "glimpse_session_B"]
        );
        assert_eq!(store.count_prefix("glimpse_session_").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_kv_store_impl() {
        let store = SqliteStore::in_memory().unwrap();
        let kv: &dyn KvStore = &store;

        kv.set("a", "1".into()).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some("1".into()));
        assert_eq!(kv.list_keys("a").await.unwrap(), vec!["a"]);
        kv.delete("a").await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());
        assert_eq!(kv.name(), "sqlite");
    }

    #[test]
    fn test_swap_value() {
        let store = SqliteStore::in_memory().unwrap();
        let key = "glimpse_signaling_BA7ZUM4E_host_1";

        assert!(store.swap_value(key, None, Some("[1]")).unwrap());
        assert!(!store.swap_value(key, None, Some("[2]")).unwrap());
        assert!(!store.swap_value(key, Some("[0]"), Some("[2]")).unwrap());
        assert_eq!(store.get_value(key).unwrap(), Some("[1]".into()));

        assert!(store.swap_value(key, Some("[1]"), Some("[1,2]")).unwrap());
        assert_eq!(store.get_value(key).unwrap(), Some("[1,2]".into()));

        assert!(store.swap_value(key, Some("[1,2]"), None).unwrap());
        assert!(store.get_value(key).unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glimpse.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_value("glimpse_session_K7XMP2QB", "{}").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_value("glimpse_session_K7XMP2QB").unwrap().is_some());
    }
}
