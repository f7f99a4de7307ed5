//! File-backed chunk store.
//!
//! Layout: `<dir>/<sha1(item) hex>/chunk_<index>`. Item ids are hashed since
//! titles may contain characters that are not valid in file names.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::fs;

use super::{ChunkStore, StoreError};
use crate::item::{ChunkKey, ItemId};

/// Stores one file per chunk under a base directory.
#[derive(Debug, Clone)]
pub struct FileChunkStore {
    base_dir: PathBuf,
}

impl FileChunkStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding every chunk of `item`.
    pub fn item_dir(&self, item: &ItemId) -> PathBuf {
        let digest = Sha1::digest(item.as_str().as_bytes());
        self.base_dir.join(hex::encode(digest))
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.item_dir(&key.item).join(format!("chunk_{}", key.index))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn get(&self, key: &ChunkKey) -> Result<Option<Bytes>, StoreError> {
        let path = self.chunk_path(key);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    async fn put(&self, key: &ChunkKey, data: Bytes) -> Result<(), StoreError> {
        let path = self.chunk_path(key);
        if fs::try_exists(&path).await.map_err(io_error(&path))? {
            return Ok(());
        }

        let dir = self.item_dir(&key.item);
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        // Readers must never observe a partially written chunk.
        let temp = dir.join(format!("chunk_{}.{}.tmp", key.index, uuid::Uuid::new_v4()));
        fs::write(&temp, &data).await.map_err(io_error(&temp))?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error(&path)(e));
        }

        tracing::trace!("Stored chunk {} at {}", key, path.display());
        Ok(())
    }

    async fn contains(&self, key: &ChunkKey) -> Result<bool, StoreError> {
        let path = self.chunk_path(key);
        fs::try_exists(&path).await.map_err(io_error(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::new(dir.path());
        let key = ChunkKey::new(ItemId::from("Big Buck Bunny: Director's Cut"), 7);

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.put(&key, Bytes::from_static(b"chunk bytes")).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), Some(Bytes::from_static(b"chunk bytes")));
        assert!(store.chunk_path(&key).ends_with("chunk_7"));
        assert!(store.chunk_path(&key).starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_existing_chunk_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::new(dir.path());
        let key = ChunkKey::new(ItemId::from("A"), 0);

        store.put(&key, Bytes::from_static(b"one")).await.unwrap();
        store.put(&key, Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), Some(Bytes::from_static(b"one")));
        let leftovers = std::fs::read_dir(store.item_dir(&key.item)).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_item_dir_is_sha1_hex() {
        let store = FileChunkStore::new("/chunks");
        let dir = store.item_dir(&ItemId::from("abc"));
        assert_eq!(
            dir,
            PathBuf::from("/chunks/a9993e364706816aba3e25717850c26c9cd0d89d")
        );
    }
}
