//! Shared key/value store abstraction
//!
//! The registry and relay never touch a storage substrate directly. They are
//! parameterized by an `Arc<dyn KvStore>`, so an in-process map, a SQLite file,
//! or a remote store server can be swapped without changing business logic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;

/// Key/value store with prefix enumeration.
///
/// Single-key operations are atomic on their own. Read-modify-write callers
/// use [`KvStore::compare_and_set`] and retry when it reports a conflict;
/// there is no cross-key atomicity.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List every key starting with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Replace the value of `key` only if it still equals `expected`
    ///
    /// `expected: None` means the key must be absent; `value: None` deletes it.
    /// Returns `false` without writing when the current value differs.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<String>,
    ) -> Result<bool, StoreError>;

    /// Get the name of this backend for logging
    fn name(&self) -> &'static str;
}

/// In-process store backed by an ordered map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }

        match value {
            Some(value) => entries.insert(key.to_string(), value),
            None => entries.remove(key),
        };
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
