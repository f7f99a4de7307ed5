//! Upstream streaming sources and the handles we keep open on them.
//!
//! A [`MediaSource`] opens one [`SourceSession`] per item (a torrent being
//! streamed, in production). Sessions are slow to become ready: metadata only
//! arrives once the swarm delivered the info dictionary, and reads may stall
//! until the requested pieces exist. The [`SourceHandleManager`] hides that
//! lifecycle behind a cached, deduplicated `acquire`.

pub mod manager;
pub mod selector;
#[cfg(feature = "simulation")]
pub mod simulated;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use manager::{HandleState, PrimaryFile, SourceHandle, SourceHandleManager};
pub use selector::{LargestMediaFile, PrimaryFileSelector};
#[cfg(feature = "simulation")]
pub use simulated::{SimulatedSource, SimulatedTitle};

use crate::item::ItemId;

/// Errors raised by sources and the handle manager.
///
/// Cloneable because one failed acquisition is reported to every caller
/// attached to it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("Invalid source descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("No source descriptor registered for {item}")]
    NoDescriptor { item: ItemId },

    #[error("Failed to open source for {item}: {reason}")]
    ConnectionFailed { item: ItemId, reason: String },

    #[error("Source for {item} contains no playable file")]
    NoPrimaryFile { item: ItemId },

    #[error("Source for {item} is not ready")]
    NotReady { item: ItemId },

    #[error("Range read failed: {reason}")]
    ReadFailed { reason: String },
}

/// How to reach an item's upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// A BitTorrent magnet URI
    Magnet(MagnetDescriptor),
    /// Any other locator understood by the configured [`MediaSource`]
    Locator(String),
}

/// Parsed form of a magnet URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetDescriptor {
    pub uri: String,
    /// Lowercase btih value (hex or base32, as given)
    pub info_hash: String,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl SourceDescriptor {
    /// Parses a magnet URI when the input starts with `magnet:`, otherwise
    /// keeps the input as an opaque locator.
    ///
    /// # Errors
    /// - `SourceError::InvalidDescriptor` - Empty input or malformed magnet URI
    pub fn parse(input: &str) -> Result<Self, SourceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SourceError::InvalidDescriptor {
                reason: "empty descriptor".to_string(),
            });
        }

        if input.starts_with("magnet:") {
            Self::magnet(input)
        } else {
            Ok(Self::Locator(input.to_string()))
        }
    }

    /// Parses and validates a magnet URI.
    ///
    /// # Errors
    /// - `SourceError::InvalidDescriptor` - Malformed URI or missing/invalid btih
    pub fn magnet(uri: &str) -> Result<Self, SourceError> {
        let magnet = magnet_url::Magnet::new(uri).map_err(|e| SourceError::InvalidDescriptor {
            reason: format!("invalid magnet link: {e}"),
        })?;

        let info_hash = extract_btih(uri)?;

        Ok(Self::Magnet(MagnetDescriptor {
            uri: uri.to_string(),
            info_hash,
            display_name: magnet.display_name().map(|name| name.to_string()),
            trackers: magnet.trackers().to_vec(),
        }))
    }

    pub fn as_uri(&self) -> &str {
        match self {
            Self::Magnet(magnet) => &magnet.uri,
            Self::Locator(locator) => locator,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Magnet(magnet) => magnet.display_name.as_deref(),
            Self::Locator(_) => None,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Magnet(magnet) => write!(f, "magnet:{}", magnet.info_hash),
            Self::Locator(locator) => f.write_str(locator),
        }
    }
}

fn extract_btih(uri: &str) -> Result<String, SourceError> {
    let query = uri.split_once('?').map(|(_, query)| query).unwrap_or("");

    let hash = query
        .split('&')
        .find_map(|param| param.strip_prefix("xt=urn:btih:"))
        .ok_or_else(|| SourceError::InvalidDescriptor {
            reason: format!("missing btih exact topic in {uri}"),
        })?;

    let valid = match hash.len() {
        40 => hex::decode(hash).is_ok(),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_lowercase() || ('2'..='7').contains(&c)),
        _ => false,
    };

    if valid {
        Ok(hash.to_ascii_lowercase())
    } else {
        Err(SourceError::InvalidDescriptor {
            reason: format!("invalid btih value: {hash}"),
        })
    }
}

/// One file inside a source (a torrent may carry subtitles, samples, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub length: u64,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// Metadata a session reports once it is ready.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceMetadata {
    pub files: Vec<SourceFile>,
}

impl SourceMetadata {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }
}

/// Opens sessions against the upstream (e.g. adds a torrent to a client).
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Opens a session for `item`.
    ///
    /// Returning `Ok` only means the session exists; readiness is reported
    /// through [`SourceSession::wait_ready`].
    ///
    /// # Errors
    /// - `SourceError::ConnectionFailed` - The upstream refused or is unreachable
    async fn open(
        &self,
        item: &ItemId,
        descriptor: &SourceDescriptor,
    ) -> Result<Arc<dyn SourceSession>, SourceError>;
}

/// An open session that can serve byte ranges of its files.
#[async_trait]
pub trait SourceSession: Send + Sync {
    /// Resolves once file metadata is available.
    ///
    /// # Errors
    /// - `SourceError::ConnectionFailed` - The session died before becoming ready
    async fn wait_ready(&self) -> Result<SourceMetadata, SourceError>;

    /// Metadata if already known, without waiting.
    fn metadata(&self) -> Option<SourceMetadata>;

    /// Reads `length` bytes at `offset` of file `file_index`.
    ///
    /// May return fewer bytes (including zero) when the upstream has not
    /// delivered the range yet.
    ///
    /// # Errors
    /// - `SourceError::ReadFailed` - Transient stream fault
    /// - `SourceError::ConnectionFailed` - The session is gone and must be reopened
    async fn read_range(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SourceError>;
}
