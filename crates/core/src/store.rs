//! Persistent key-value store seam.
//!
//! The engine persists two kinds of keys: `"{account}:account"` for the
//! serialized account snapshot, and `"{channel_id}:incoming-channel"`
//! for the channel-uniqueness registry.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Key-value persistence used by the engine.
///
/// Implementations are expected to be individually reentrant-safe; the
/// engine imposes no additional locking.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Hydrate a key from the backing store into any cache layer.
    async fn load(&self, key: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Drop a key from the cache layer (the durable copy survives).
    async fn unload(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().expect("store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn unload(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
