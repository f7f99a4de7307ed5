//! Item identity and the catalog of per-item chunk geometry.
//!
//! An item is a logical media asset split into fixed-size chunks. Items are
//! created implicitly on first touch and live for the whole process; the only
//! mutation of their size metadata happens once the upstream source reports
//! the real length of the primary media file.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;

use crate::source::SourceDescriptor;

/// Fallback MIME type when the primary file name carries no usable extension.
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Stable key identifying a media item (typically its title).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Creates an item identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Address of one chunk: the item plus its zero-based chunk index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub item: ItemId,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(item: ItemId, index: u32) -> Self {
        Self { item, index }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.item, self.index)
    }
}

/// Chunk geometry and media type of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInfo {
    /// Number of chunks covering the primary file
    pub total_chunks: u32,
    /// Size of every chunk but the last, in bytes
    pub chunk_size: u32,
    /// Length of the primary media file in bytes
    pub file_size: u64,
    /// MIME type guessed from the primary file name
    pub mime_type: String,
    /// Whether the sizes come from real source metadata
    pub metadata_known: bool,
}

impl ItemInfo {
    fn placeholder(chunk_size: u32) -> Self {
        Self {
            total_chunks: 0,
            chunk_size,
            file_size: 0,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            metadata_known: false,
        }
    }

    /// Byte offset of a chunk within the primary file.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.chunk_size)
    }
}

#[derive(Debug)]
struct ItemRecord {
    info: ItemInfo,
    descriptor: Option<SourceDescriptor>,
}

/// Process-lifetime store of item geometry and source descriptors.
#[derive(Debug)]
pub struct ItemCatalog {
    items: RwLock<HashMap<ItemId, ItemRecord>>,
    default_chunk_size: u32,
}

impl ItemCatalog {
    /// Creates an empty catalog whose implicitly created items use
    /// `default_chunk_size`.
    pub fn new(default_chunk_size: u32) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            default_chunk_size: default_chunk_size.max(1),
        }
    }

    /// Returns the item's info, creating a placeholder entry if it is unknown.
    pub fn touch(&self, item: &ItemId) -> ItemInfo {
        if let Some(record) = self.items.read().get(item) {
            return record.info.clone();
        }

        let mut items = self.items.write();
        items
            .entry(item.clone())
            .or_insert_with(|| ItemRecord {
                info: ItemInfo::placeholder(self.default_chunk_size),
                descriptor: None,
            })
            .info
            .clone()
    }

    /// Returns the item's info without creating it.
    pub fn info(&self, item: &ItemId) -> Option<ItemInfo> {
        self.items.read().get(item).map(|record| record.info.clone())
    }

    /// Overrides the chunk size used for an item.
    ///
    /// Only honoured while the item has no real metadata yet; afterwards the
    /// chunk grid is fixed because buffers and stored chunks depend on it.
    pub fn set_chunk_size(&self, item: &ItemId, chunk_size: u32) -> bool {
        let mut items = self.items.write();
        let record = items.entry(item.clone()).or_insert_with(|| ItemRecord {
            info: ItemInfo::placeholder(self.default_chunk_size),
            descriptor: None,
        });

        if record.info.metadata_known {
            return false;
        }
        record.info.chunk_size = chunk_size.max(1);
        true
    }

    /// Stores the source descriptor used to (re)acquire the item's handle.
    pub fn set_descriptor(&self, item: &ItemId, descriptor: SourceDescriptor) {
        let mut items = self.items.write();
        let record = items.entry(item.clone()).or_insert_with(|| ItemRecord {
            info: ItemInfo::placeholder(self.default_chunk_size),
            descriptor: None,
        });
        record.descriptor = Some(descriptor);
    }

    /// Returns the stored source descriptor, if any.
    pub fn descriptor(&self, item: &ItemId) -> Option<SourceDescriptor> {
        self.items
            .read()
            .get(item)
            .and_then(|record| record.descriptor.clone())
    }

    /// Records the real length and name of the item's primary file.
    ///
    /// Recomputes `total_chunks` from the item's chunk size and guesses the
    /// MIME type from the file name.
    pub fn apply_source_metadata(&self, item: &ItemId, file_size: u64, file_name: &str) -> ItemInfo {
        let mut items = self.items.write();
        let record = items.entry(item.clone()).or_insert_with(|| ItemRecord {
            info: ItemInfo::placeholder(self.default_chunk_size),
            descriptor: None,
        });

        let info = &mut record.info;
        let chunk_size = u64::from(info.chunk_size);
        info.file_size = file_size;
        info.total_chunks = u32::try_from(file_size.div_ceil(chunk_size)).unwrap_or(u32::MAX);
        info.mime_type = mime_guess::from_path(file_name)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        info.metadata_known = true;

        tracing::debug!(
            "Item {} metadata: {} bytes in {} chunks of {} ({})",
            item,
            info.file_size,
            info.total_chunks,
            info.chunk_size,
            info.mime_type
        );

        info.clone()
    }

    /// Number of items known to the catalog.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}
