//! Undertow Core - Chunk-level media delivery
//!
//! This crate provides the building blocks for serving large media files in
//! fixed-size chunks: a registry of which peers hold which chunks, a
//! deduplicating extraction pipeline over an upstream source, and a
//! worker-pool scheduler that downloads whole items in parallel with
//! priority ordering.

pub mod config;
pub mod extraction;
pub mod item;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod store;
pub mod tracing_setup;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use extraction::{ChunkExtractor, ExtractionError};
pub use item::{ChunkKey, ItemCatalog, ItemId, ItemInfo};
pub use registry::{ClaimRegistry, ClaimantId};
pub use scheduler::{SchedulerError, StreamEvent, StreamStrategy, StreamingStats, WorkerPool};
pub use service::ChunkService;
pub use source::{MediaSource, SourceDescriptor, SourceError};
pub use store::{ChunkStore, FileChunkStore, MemoryChunkStore, StoreError};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Metadata for {item} is not available yet")]
    MetadataUnavailable { item: ItemId },
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Source(e) => match e {
                SourceError::InvalidDescriptor { reason } => {
                    format!("Invalid source descriptor: {reason}")
                }
                SourceError::NoDescriptor { item } => {
                    format!("No source registered for {item}")
                }
                SourceError::NoPrimaryFile { item } => {
                    format!("{item} contains no playable file")
                }
                _ => "Source error occurred".to_string(),
            },
            UndertowError::Extraction(e) => match e {
                ExtractionError::OutOfRange {
                    index,
                    total_chunks,
                    ..
                } => format!("Chunk {index} is out of range ({total_chunks} chunks)"),
                ExtractionError::RetriesExhausted { attempts, .. } => {
                    format!("Chunk unavailable after {attempts} attempts")
                }
                _ => "Extraction error occurred".to_string(),
            },
            UndertowError::Scheduler(SchedulerError::PoolShutdown) => {
                "Service is shutting down".to_string()
            }
            UndertowError::Scheduler(_) => "Download error occurred".to_string(),
            UndertowError::MetadataUnavailable { item } => {
                format!("{item} is not ready for streaming yet")
            }
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Source(SourceError::InvalidDescriptor { .. })
                | UndertowError::Extraction(ExtractionError::OutOfRange { .. })
        )
    }

    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            UndertowError::Source(e) => !matches!(
                e,
                SourceError::InvalidDescriptor { .. }
                    | SourceError::NoDescriptor { .. }
                    | SourceError::NoPrimaryFile { .. }
            ),
            UndertowError::Extraction(e) => e.is_retryable(),
            UndertowError::Scheduler(e) => e.is_retryable(),
            UndertowError::MetadataUnavailable { .. } => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
