//! LRU-bounded in-memory chunk store.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use super::{ChunkStore, StoreError};
use crate::item::ChunkKey;

/// Keeps the most recently used chunks in memory.
pub struct MemoryChunkStore {
    chunks: Mutex<LruCache<ChunkKey, Bytes>>,
    capacity: NonZeroUsize,
}

impl MemoryChunkStore {
    /// Creates a store holding at most `capacity` chunks (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            chunks: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<Bytes>, StoreError> {
        Ok(self.chunks.lock().get(key).cloned())
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        let mut chunks = self.chunks.lock();
        if chunks.get(key).is_none() {
            if let Some((evicted, _)) = chunks.push(key.clone(), data) {
                tracing::trace!("Evicted chunk {} from memory store", evicted);
            }
        }
        Ok(())
    }

    async fn contains(&self, key: &ChunkKey) -> Result<bool, StoreError> {
        Ok(self.chunks.lock().contains(key))
    }
}
