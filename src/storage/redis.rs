// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis primary store.
//!
//! Documents are stored as plain Redis strings holding the canonical JSON
//! bytes, one key per plan and one per linked service:
//!
//! ```text
//! SET {prefix}plan-1  {"linkedPlanServices":[...],"objectId":"plan-1",...}
//! SET {prefix}svc-1   {"objectId":"svc-1",...}
//! ```
//!
//! Every command is wrapped in [`retry`] with the query preset, so a brief
//! connection blip is absorbed instead of failing the request.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use super::traits::{PrimaryStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "plans:" → "plans:plan-1")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use plan_sync::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("plans:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // Use startup config: fast-fail, don't hang forever
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Connection(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Wrap an existing connection (shared with the queue, for example).
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        }
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }
}

#[async_trait]
impl PrimaryStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_exists", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let exists: bool = conn.exists(&key).await?;
                Ok(exists)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let _: () = conn.set(&key, value).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }
}
