//! Encrypted key-value storage contracts.
//!
//! The on-device store encrypts at rest and is consumed through
//! [`KeyValueStore`]; values cross the boundary as JSON. Typed access goes
//! through [`KeyValueStoreExt`], which any store implementation gets for
//! free. Storage keys are stable string identifiers collected in [`keys`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Stable storage key identifiers.
pub mod keys {
    pub const TRACING_SECRET: &str = "tracing_secret";
    pub const GUEST_KEY_PAIR_PREFIX: &str = "guest_key_pair_";
    pub const DAILY_KEY: &str = "daily_key";
    pub const ARCHIVED_CHECK_INS: &str = "archived_check_ins";
    pub const DOCUMENTS: &str = "documents";
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("no value stored for '{0}'")]
    Missing(String),
    #[error("value for '{0}' could not be decoded: {1}")]
    Corrupt(String, String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn persist_raw(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
    async fn restore_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed helpers over any [`KeyValueStore`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn persist<T>(&self, key: &str, value: &T) -> Result<(), StorageError>
    where
        T: Serialize + Send + Sync,
    {
        let value = serde_json::to_value(value)
            .map_err(|e| StorageError::Corrupt(key.to_string(), e.to_string()))?;
        self.persist_raw(key, value).await
    }

    async fn restore<T>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        T: DeserializeOwned,
    {
        match self.restore_raw(key).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(key.to_string(), e.to_string())),
        }
    }

    async fn restore_or_default<T>(&self, key: &str) -> Result<T, StorageError>
    where
        T: DeserializeOwned + Default,
    {
        Ok(self.restore(key).await?.unwrap_or_default())
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

/// In-memory store used in tests.
#[derive(Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn persist_raw(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn restore_raw(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().await.remove(key);
        Ok(())
    }
}
