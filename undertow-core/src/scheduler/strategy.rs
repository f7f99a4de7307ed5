//! Download strategy and derived streaming statistics.

use serde::Serialize;

use super::buffer::DeliveryBuffer;

/// Summary returned when a stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStrategy {
    /// Leading chunks fetched first for immediate playback
    pub priority_chunk_count: u32,
    /// Remaining chunks fetched after priority issuance began
    pub background_chunk_count: u32,
    pub worker_count: usize,
}

impl StreamStrategy {
    pub fn plan(total_chunks: u32, priority_chunks: u32, worker_count: usize) -> Self {
        let priority_chunk_count = priority_chunks.min(total_chunks);
        Self {
            priority_chunk_count,
            background_chunk_count: total_chunks - priority_chunk_count,
            worker_count,
        }
    }

    pub fn is_priority(&self, index: u32) -> bool {
        index < self.priority_chunk_count
    }

    /// Chunks still to fetch, priority first, each tagged with its class.
    pub fn issue_order(&self, buffer: &DeliveryBuffer) -> Vec<(u32, bool)> {
        buffer
            .missing()
            .map(|index| (index, self.is_priority(index)))
            .collect()
    }
}

/// Snapshot of a stream's progress, derived on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStats {
    pub total_chunks: u32,
    pub available_chunks: u32,
    /// Percentage with one decimal, e.g. `"40.0"`
    pub completed_percentage: String,
    pub workers_active: usize,
    pub total_workers: usize,
    pub queue_length: usize,
}

impl StreamingStats {
    pub fn derive(
        buffer: &DeliveryBuffer,
        workers_active: usize,
        total_workers: usize,
        queue_length: usize,
    ) -> Self {
        Self {
            total_chunks: buffer.total_chunks(),
            available_chunks: buffer.available(),
            completed_percentage: completed_percentage(buffer.available(), buffer.total_chunks()),
            workers_active,
            total_workers,
            queue_length,
        }
    }
}

fn completed_percentage(available: u32, total: u32) -> String {
    if total == 0 {
        return "0.0".to_string();
    }
    format!("{:.1}", f64::from(available) * 100.0 / f64::from(total))
}
