//! Counters describing what the extraction pipeline did.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::item::ItemId;

/// Point-in-time copy of the extraction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionMetrics {
    /// Range reads issued against source handles
    pub source_reads: u64,
    /// Extraction attempts, including retries
    pub attempts: u64,
    /// Requests answered from the byte store
    pub cache_hits: u64,
    /// Requests that attached to an extraction already in flight
    pub joined_in_flight: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct ActiveCount {
    current: usize,
    peak: usize,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    source_reads: AtomicU64,
    attempts: AtomicU64,
    cache_hits: AtomicU64,
    joined_in_flight: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: Mutex<HashMap<ItemId, ActiveCount>>,
}

impl MetricsRecorder {
    pub(crate) fn source_read(&self) {
        self.source_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn joined(&self) {
        self.joined_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self, success: bool) {
        let counter = if success { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an extraction as active for `item` until the guard drops.
    pub(crate) fn track_active(self: &Arc<Self>, item: &ItemId) -> ActiveGuard {
        {
            let mut active = self.active.lock();
            let count = active.entry(item.clone()).or_default();
            count.current += 1;
            count.peak = count.peak.max(count.current);
        }
        ActiveGuard {
            recorder: Arc::clone(self),
            item: item.clone(),
        }
    }

    pub(crate) fn active(&self, item: &ItemId) -> usize {
        self.active.lock().get(item).map_or(0, |count| count.current)
    }

    pub(crate) fn peak_active(&self, item: &ItemId) -> usize {
        self.active.lock().get(item).map_or(0, |count| count.peak)
    }

    pub(crate) fn snapshot(&self) -> ExtractionMetrics {
        ExtractionMetrics {
            source_reads: self.source_reads.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            joined_in_flight: self.joined_in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ActiveGuard {
    recorder: Arc<MetricsRecorder>,
    item: ItemId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(count) = self.recorder.active.lock().get_mut(&self.item) {
            count.current = count.current.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_guard_tracks_peak() {
        let recorder = Arc::new(MetricsRecorder::default());
        let item = ItemId::from("A");

        let first = recorder.track_active(&item);
        let second = recorder.track_active(&item);
        assert_eq!(recorder.active(&item), 2);

        drop(first);
        drop(second);
        let _third = recorder.track_active(&item);

        assert_eq!(recorder.active(&item), 1);
        assert_eq!(recorder.peak_active(&item), 2);
    }

    #[test]
    fn test_snapshot_counts() {
        let recorder = MetricsRecorder::default();
        recorder.source_read();
        recorder.attempt();
        recorder.attempt();
        recorder.finished(true);
        recorder.finished(false);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.source_reads, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
    }
}
