// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use super::traits::{PrimaryStore, StorageError};

pub struct InMemoryStore {
    data: DashMap<String, Vec<u8>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current key count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of stored keys (unordered)
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryStore for InMemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("plan-1", br#"{"objectId":"plan-1"}"#).await.unwrap();

        let result = store.get("plan-1").await.unwrap();
        assert_eq!(result.as_deref(), Some(&br#"{"objectId":"plan-1"}"#[..]));
        assert!(store.exists("plan-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_nonexistent_returns_none() {
        let store = InMemoryStore::new();
        assert!(store.get("nonexistent").await.unwrap().is_none());
        assert!(!store.exists("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryStore::new();
        store.set("to-delete", b"{}").await.unwrap();
        store.delete("to-delete").await.unwrap();

        assert!(store.is_empty());
        assert!(store.get("to-delete").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = InMemoryStore::new();
        assert!(store.delete("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryStore::new();
        store.set("same", b"1").await.unwrap();
        store.set("same", b"2").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("same").await.unwrap().unwrap(), b"2".to_vec());
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store.set(&format!("batch-{}-key-{}", batch, i), b"{}").await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
