// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Stored value for '{id}' is not a valid document: {reason}")]
    Corruption {
        id: String,
        reason: String,
    },
}

/// Key-value primary store holding plans and linked services.
///
/// Single-key operations are linearizable. There are no transactions and no
/// conditional writes; callers enforce preconditions by comparing fingerprints.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
