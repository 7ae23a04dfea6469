//! In-memory storage backend for testing.
//!
//! Stores all data in a `BTreeMap` behind a `RwLock`. Not persistent — all
//! data is lost when the process exits. Use this for unit tests and for the
//! daemon's zero-config dev mode.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError};

/// An in-memory key-value store, ordered by key so prefix listing is cheap.
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create a new, empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("a", b"1").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.put("a", b"1").await.unwrap();
        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_respects_prefix() {
        let backend = MemoryBackend::new();
        backend.put("sessions/a", b"1").await.unwrap();
        backend.put("sessions/b", b"2").await.unwrap();
        backend.put("credentials/c", b"3").await.unwrap();

        let mut keys = backend.list("sessions/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["sessions/a", "sessions/b"]);
    }

    #[tokio::test]
    async fn exists_default_impl() {
        let backend = MemoryBackend::new();
        assert!(!backend.exists("a").await.unwrap());
        backend.put("a", b"1").await.unwrap();
        assert!(backend.exists("a").await.unwrap());
    }
}
