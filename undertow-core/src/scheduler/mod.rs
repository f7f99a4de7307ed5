//! Worker-pool scheduler for parallel chunk acquisition.
//!
//! A single actor task owns the worker records, the FIFO task queue and every
//! stream's delivery buffer. Workers are long-lived tokio tasks that execute
//! one [`ChunkTask`] at a time through a [`ChunkFetcher`] and report back to
//! the actor. A panicking worker is detected through its `JoinHandle` and
//! replaced in the same slot after a delay.

pub mod buffer;
pub mod pool;
pub mod strategy;
mod worker;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

pub use buffer::{BufferWrite, DeliveryBuffer};
pub use pool::{PoolStats, WorkerPool};
pub use strategy::{StreamStrategy, StreamingStats};

use crate::extraction::ExtractionError;
use crate::item::ItemId;
use crate::registry::ClaimantId;

/// Errors surfaced to callers of the worker pool.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("Worker {slot} timed out after {after:?}")]
    WorkerTimeout { slot: usize, after: Duration },

    #[error("Worker {slot} crashed while running the task")]
    WorkerCrash { slot: usize },

    #[error(transparent)]
    Fetch(#[from] ExtractionError),

    #[error("Worker pool is shut down")]
    PoolShutdown,
}

impl SchedulerError {
    /// Timeouts and crashes are recovered by the pool; the caller may resubmit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WorkerTimeout { .. } | Self::WorkerCrash { .. } => true,
            Self::Fetch(e) => e.is_retryable(),
            Self::PoolShutdown => false,
        }
    }
}

/// Unique identifier for scheduled tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chunk download assigned to a worker.
#[derive(Debug, Clone)]
pub struct ChunkTask {
    pub id: TaskId,
    pub item: ItemId,
    pub index: u32,
    pub priority: bool,
    /// Claimants reported to hold the chunk; advisory only
    pub hint_sources: Vec<ClaimantId>,
}

impl ChunkTask {
    pub fn new(item: ItemId, index: u32) -> Self {
        Self {
            id: TaskId::new(),
            item,
            index,
            priority: false,
            hint_sources: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_hints(mut self, hint_sources: Vec<ClaimantId>) -> Self {
        self.hint_sources = hint_sources;
        self
    }
}

/// Executes chunk tasks on behalf of workers.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Fetches the bytes of the task's chunk.
    ///
    /// # Errors
    /// - `ExtractionError` - Fetch failed; see its variants for retryability
    async fn fetch(&self, task: &ChunkTask) -> Result<Bytes, ExtractionError>;
}

/// Asynchronous notification about a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// A chunk landed in the delivery buffer
    ChunkReady {
        item: ItemId,
        index: u32,
        priority: bool,
    },
    /// Every priority chunk is available; emitted once per stream
    StreamReady {
        item: ItemId,
        ready_chunks: u32,
        total_chunks: u32,
    },
    /// 0 when a worker picks the chunk up, 100 when it completes
    ChunkProgress { item: ItemId, index: u32, percent: u8 },
    ChunkFailed {
        item: ItemId,
        index: u32,
        error: String,
        retryable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(SchedulerError::WorkerTimeout {
            slot: 0,
            after: Duration::from_secs(30)
        }
        .is_retryable());
        assert!(SchedulerError::WorkerCrash { slot: 1 }.is_retryable());
        assert!(!SchedulerError::PoolShutdown.is_retryable());

        let out_of_range = SchedulerError::from(ExtractionError::OutOfRange {
            item: ItemId::from("B"),
            index: 50,
            total_chunks: 40,
        });
        assert!(!out_of_range.is_retryable());
    }

    #[test]
    fn test_event_serialization() {
        let event = StreamEvent::StreamReady {
            item: ItemId::from("A"),
            ready_chunks: 5,
            total_chunks: 10,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "streamReady");
        assert_eq!(json["item"], "A");
        assert_eq!(json["readyChunks"], 5);
    }
}
