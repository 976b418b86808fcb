//! In-memory key-value store
//!
//! Used in tests and for the `memory` storage backend. An optional byte
//! quota makes it possible to exercise `QuotaExceeded` handling.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use super::error::{StorageError, StorageResult};
use super::KeyValueStore;

/// Key-value store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once the serialized size of all
    /// values would exceed `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A panic while holding the lock leaves the map itself intact
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> StorageResult<()> {
        let mut entries = self.lock();

        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.to_string().len())
                .sum();
            if others + value.to_string().len() > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_delete() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());

        store.set("a", &json!({"x": 1})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));

        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_quota_rejects_oversized_write() {
        let store = MemoryStore::with_quota(16);
        store.set("small", &json!("abc")).unwrap();

        let err = store
            .set("big", &json!("this value is far too long"))
            .unwrap_err();
        assert!(err.is_quota_exceeded());

        // The rejected write left nothing behind
        assert!(store.get("big").unwrap().is_none());
        assert_eq!(store.get("small").unwrap(), Some(json!("abc")));
    }

    #[test]
    fn test_quota_counts_replacement_not_addition() {
        let store = MemoryStore::with_quota(10);
        store.set("k", &json!("12345")).unwrap();
        store.set("k", &json!("1234567")).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!("1234567")));
    }
}
