//! Storage the log consumes.
//!
//! Entry blocks and heads pages go to a content-addressed [`BlockStore`];
//! the two mutable chain pointers go to a [`KeyValueStore`].

use crate::hash::{Hash, Hasher};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Content-addressed storage of raw bytes.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store bytes under their SHA-256 hash.
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, StoreError>;

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError>;

    async fn rm(&self, hash: &Hash) -> Result<(), StoreError>;
}

/// Mutable records addressed by path.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store implementing both traits. Clones share state, so a
/// log can be closed and reopened over the same contents.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    blocks: Arc<RwLock<HashMap<Hash, Vec<u8>>>>,
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    /// Write bytes under an arbitrary hash, bypassing content addressing.
    pub fn put_raw(&self, hash: Hash, bytes: Vec<u8>) {
        self.blocks.write().insert(hash, bytes);
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, StoreError> {
        let hash = Hasher::hash(&bytes);
        self.blocks.write().insert(hash, bytes);
        Ok(hash)
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.blocks.read().contains_key(hash))
    }

    async fn rm(&self, hash: &Hash) -> Result<(), StoreError> {
        self.blocks.write().remove(hash);
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.values.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocks_are_content_addressed() {
        let store = MemoryStore::new();
        let hash = BlockStore::put(&store, b"block".to_vec()).await.unwrap();
        assert_eq!(hash, Hasher::hash(b"block"));
        assert!(store.has(&hash).await.unwrap());
        assert_eq!(
            BlockStore::get(&store, &hash).await.unwrap(),
            Some(b"block".to_vec())
        );

        store.rm(&hash).await.unwrap();
        assert!(!store.has(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_values_shared_between_clones() {
        let store = MemoryStore::new();
        let clone = store.clone();
        KeyValueStore::put(&store, "log/heads", b"ptr".to_vec())
            .await
            .unwrap();
        assert_eq!(
            KeyValueStore::get(&clone, "log/heads").await.unwrap(),
            Some(b"ptr".to_vec())
        );
        clone.delete("log/heads").await.unwrap();
        assert_eq!(KeyValueStore::get(&store, "log/heads").await.unwrap(), None);
    }
}
