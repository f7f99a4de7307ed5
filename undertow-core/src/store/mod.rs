//! Persistence of extracted chunk bytes.
//!
//! The store is keyed by (item, chunk index). Writes are idempotent: chunk
//! contents never change for a given key, so concurrent writers race
//! harmlessly.

pub mod file;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;

use crate::config::StorageConfig;
use crate::item::ChunkKey;

/// Errors that can occur while persisting chunks.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Key-value byte store for extracted chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Returns the chunk bytes, or `None` if never stored.
    ///
    /// # Errors
    /// - `StoreError::Io` - Backing storage failed
    async fn get(&self, key: &ChunkKey) -> Result<Option<Bytes>, StoreError>;

    /// Stores chunk bytes. Storing an existing key again is a no-op.
    ///
    /// # Errors
    /// - `StoreError::Io` - Backing storage failed
    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError>;

    /// # Errors
    /// - `StoreError::Io` - Backing storage failed
    async fn contains(&self, key: &ChunkKey) -> Result<bool, StoreError>;
}

/// Builds the store selected by the configuration: file-backed when a chunk
/// directory is set, in-memory otherwise.
pub fn store_from_config(config: &StorageConfig) -> Arc<dyn ChunkStore> {
    match &config.chunk_dir {
        Some(dir) => {
            tracing::info!("Persisting chunks under {}", dir.display());
            Arc::new(FileChunkStore::new(dir.clone()))
        }
        None => Arc::new(MemoryChunkStore::new(config.memory_capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemId;

    #[tokio::test]
    async fn test_store_from_config_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let key = ChunkKey::new(ItemId::from("A"), 0);

        let memory = store_from_config(&StorageConfig::default());
        memory.put(&key, Bytes::from_static(b"m")).await.unwrap();
        assert!(memory.contains(&key).await.unwrap());

        let config = StorageConfig {
            chunk_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let file = store_from_config(&config);
        assert!(!file.contains(&key).await.unwrap());
        file.put(&key, Bytes::from_static(b"f")).await.unwrap();
        assert_eq!(file.get(&key).await.unwrap(), Some(Bytes::from_static(b"f")));
    }
}
