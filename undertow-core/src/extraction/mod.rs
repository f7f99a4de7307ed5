//! Chunk extraction from upstream source handles.
//!
//! [`ChunkExtractor::extract`] turns `(item, index)` into chunk bytes:
//!
//! 1. Answered from the byte store when the chunk was extracted before.
//! 2. Attached to the extraction already in flight for the same key, so a
//!    key is read from the source at most once at a time.
//! 3. Otherwise a new extraction waits for one of the item's concurrency
//!    permits, acquires the source handle and reads the chunk's byte range
//!    with a per-attempt timeout, retrying transient faults with linear
//!    backoff.
//!
//! Extractions run on their own task: a caller that stops waiting does not
//! cancel the read, and the result still lands in the store for later
//! requesters.

pub mod metrics;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

pub use metrics::ExtractionMetrics;
pub use retry::{RetryDecision, RetryPolicy};

use self::metrics::MetricsRecorder;
use crate::config::UndertowConfig;
use crate::item::{ChunkKey, ItemCatalog, ItemId};
use crate::scheduler::{ChunkFetcher, ChunkTask};
use crate::source::{SourceError, SourceHandle, SourceHandleManager};
use crate::store::ChunkStore;

/// Transient fault of a single read attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadFault {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("read returned no data")]
    EmptyRead,

    #[error("stream fault: {0}")]
    StreamFault(String),
}

/// Terminal outcome of a failed extraction.
///
/// Cloneable because every caller attached to an extraction receives it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExtractionError {
    #[error("Chunk {index} of {item} is out of range (item has {total_chunks} chunks)")]
    OutOfRange {
        item: ItemId,
        index: u32,
        total_chunks: u32,
    },

    #[error("Source for {item} is unavailable: {reason}")]
    SourceUnavailable { item: ItemId, reason: String },

    #[error("Source for {item} failed: {reason}")]
    SourceFailed { item: ItemId, reason: String },

    #[error("Chunk {index} of {item} failed after {attempts} attempts: {last_fault}")]
    RetriesExhausted {
        item: ItemId,
        index: u32,
        attempts: u32,
        last_fault: ReadFault,
    },

    #[error("Extraction of chunk {index} of {item} was aborted: {reason}")]
    Aborted {
        item: ItemId,
        index: u32,
        reason: String,
    },
}

impl ExtractionError {
    /// Whether the requester may try again later.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::OutOfRange { .. } | Self::SourceUnavailable { .. }
        )
    }

    fn from_source(item: &ItemId, error: SourceError) -> Self {
        match error {
            SourceError::NoDescriptor { .. }
            | SourceError::InvalidDescriptor { .. }
            | SourceError::NoPrimaryFile { .. } => Self::SourceUnavailable {
                item: item.clone(),
                reason: error.to_string(),
            },
            SourceError::ConnectionFailed { .. }
            | SourceError::NotReady { .. }
            | SourceError::ReadFailed { .. } => Self::SourceFailed {
                item: item.clone(),
                reason: error.to_string(),
            },
        }
    }
}

type ExtractionFuture = Shared<BoxFuture<'static, Result<Bytes, ExtractionError>>>;

struct ExtractorInner {
    catalog: Arc<ItemCatalog>,
    handles: SourceHandleManager,
    store: Arc<dyn ChunkStore>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    max_concurrent_per_item: usize,
    unready_read_grace: u32,
    in_flight: Mutex<HashMap<ChunkKey, ExtractionFuture>>,
    limits: Mutex<HashMap<ItemId, Arc<Semaphore>>>,
    metrics: Arc<MetricsRecorder>,
}

/// Removes the in-flight entry when the extraction task ends, however it ends.
struct InFlightGuard {
    inner: Arc<ExtractorInner>,
    key: ChunkKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

/// Deduplicating, concurrency-bounded chunk extractor.
#[derive(Clone)]
pub struct ChunkExtractor {
    inner: Arc<ExtractorInner>,
}

impl ChunkExtractor {
    pub fn new(
        config: &UndertowConfig,
        catalog: Arc<ItemCatalog>,
        handles: SourceHandleManager,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            inner: Arc::new(ExtractorInner {
                catalog,
                handles,
                store,
                retry: RetryPolicy::from_config(&config.extraction),
                attempt_timeout: config.extraction.attempt_timeout,
                max_concurrent_per_item: config.extraction.max_concurrent_per_item.max(1),
                unready_read_grace: config.source.unready_read_grace,
                in_flight: Mutex::new(HashMap::new()),
                limits: Mutex::new(HashMap::new()),
                metrics: Arc::new(MetricsRecorder::default()),
            }),
        }
    }

    /// Returns the bytes of chunk `index` of `item`.
    ///
    /// # Errors
    /// - `ExtractionError::OutOfRange` - Index beyond the primary file
    /// - `ExtractionError::SourceUnavailable` - No usable source for the item
    /// - `ExtractionError::SourceFailed` - Source could not be opened (retryable)
    /// - `ExtractionError::RetriesExhausted` - Every read attempt faulted (retryable)
    pub async fn extract(&self, item: &ItemId, index: u32) -> Result<Bytes, ExtractionError> {
        let key = ChunkKey::new(item.clone(), index);

        if let Some(bytes) = self.inner.stored(&key).await {
            self.inner.metrics.cache_hit();
            tracing::trace!("Chunk {} served from store", key);
            return Ok(bytes);
        }

        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&key) {
                Some(pending) => {
                    self.inner.metrics.joined();
                    tracing::debug!("Attaching to in-flight extraction of {}", key);
                    pending.clone()
                }
                None => {
                    let pending = self.spawn_extraction(key.clone());
                    in_flight.insert(key, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_extraction(&self, key: ChunkKey) -> ExtractionFuture {
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
        };

        let task = tokio::spawn(async move {
            let result = guard.inner.run(&guard.key).await;
            drop(guard);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                tracing::error!("Extraction task for {} died: {}", key, e);
                Err(ExtractionError::Aborted {
                    item: key.item.clone(),
                    index: key.index,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    pub fn metrics(&self) -> ExtractionMetrics {
        self.inner.metrics.snapshot()
    }

    /// Extractions of `item` currently holding a concurrency permit.
    pub fn active_extractions(&self, item: &ItemId) -> usize {
        self.inner.metrics.active(item)
    }

    /// Highest number of simultaneous extractions seen for `item`.
    pub fn peak_extractions(&self, item: &ItemId) -> usize {
        self.inner.metrics.peak_active(item)
    }

    /// Number of distinct keys being extracted right now.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn handles(&self) -> &SourceHandleManager {
        &self.inner.handles
    }
}

#[async_trait]
impl ChunkFetcher for ChunkExtractor {
    async fn fetch(&self, task: &ChunkTask) -> Result<Bytes, ExtractionError> {
        self.extract(&task.item, task.index).await
    }
}

impl ExtractorInner {
    async fn stored(&self, key: &ChunkKey) -> Option<Bytes> {
        match self.store.get(key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Byte store lookup for {} failed: {}", key, e);
                None
            }
        }
    }

    fn limit_for(&self, item: &ItemId) -> Arc<Semaphore> {
        let mut limits = self.limits.lock();
        let limit = limits
            .entry(item.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_item)));
        Arc::clone(limit)
    }

    async fn run(&self, key: &ChunkKey) -> Result<Bytes, ExtractionError> {
        // Another extraction may have stored the chunk since the caller looked.
        if let Some(bytes) = self.stored(key).await {
            self.metrics.cache_hit();
            return Ok(bytes);
        }

        let _permit = self
            .limit_for(&key.item)
            .acquire_owned()
            .await
            .map_err(|e| ExtractionError::Aborted {
                item: key.item.clone(),
                index: key.index,
                reason: e.to_string(),
            })?;
        let _active = self.metrics.track_active(&key.item);

        let result = self.extract_from_source(key).await;
        self.metrics.finished(result.is_ok());

        match &result {
            Ok(bytes) => {
                tracing::debug!("Extracted chunk {} ({} bytes)", key, bytes.len());
                if let Err(e) = self.store.put(key, bytes.clone()).await {
                    tracing::warn!("Failed to persist chunk {}: {}", key, e);
                }
            }
            Err(e) => tracing::warn!("Extraction of chunk {} failed: {}", key, e),
        }

        result
    }

    async fn acquire(&self, item: &ItemId) -> Result<SourceHandle, ExtractionError> {
        self.handles
            .acquire(item)
            .await
            .map_err(|e| ExtractionError::from_source(item, e))
    }

    async fn extract_from_source(&self, key: &ChunkKey) -> Result<Bytes, ExtractionError> {
        let mut handle = self.acquire(&key.item).await?;
        let mut grace = self.unready_read_grace;
        let mut attempt = 1;

        loop {
            self.metrics.attempt();
            let ready = handle.is_ready() || self.handles.refresh(&handle).is_some();
            let (offset, length) = self.chunk_range(&handle, key)?;

            let fault = match self.read_once(&handle, key, offset, length).await {
                Ok(bytes) => return Ok(bytes),
                Err(fault) => fault,
            };

            if !ready && grace > 0 {
                grace -= 1;
                tracing::debug!(
                    "Read of {} against unready source failed ({}); {} grace reads left",
                    key,
                    fault,
                    grace
                );
                tokio::time::sleep(self.retry.backoff(1)).await;
            } else {
                match self.retry.after_failure(attempt) {
                    RetryDecision::Retry {
                        delay,
                        next_attempt,
                    } => {
                        tracing::warn!(
                            "Attempt {}/{} for chunk {} failed: {}; retrying in {:?}",
                            attempt,
                            self.retry.max_attempts(),
                            key,
                            fault,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next_attempt;
                    }
                    RetryDecision::GiveUp { delay } => {
                        tokio::time::sleep(delay).await;
                        return Err(ExtractionError::RetriesExhausted {
                            item: key.item.clone(),
                            index: key.index,
                            attempts: attempt,
                            last_fault: fault,
                        });
                    }
                }
            }

            // The handle was invalidated by a connection loss.
            if self.handles.cached(&key.item).is_none() {
                handle = self.acquire(&key.item).await?;
            }
        }
    }

    /// Byte range of a chunk. Without metadata the full chunk size is
    /// requested and no range check is possible.
    fn chunk_range(
        &self,
        handle: &SourceHandle,
        key: &ChunkKey,
    ) -> Result<(u64, usize), ExtractionError> {
        let info = self.catalog.touch(&key.item);
        let offset = info.chunk_offset(key.index);
        let chunk_size = u64::from(info.chunk_size);

        let Some(primary) = handle.primary_file() else {
            return Ok((offset, info.chunk_size as usize));
        };

        if offset >= primary.length {
            return Err(ExtractionError::OutOfRange {
                item: key.item.clone(),
                index: key.index,
                total_chunks: info.total_chunks,
            });
        }

        let length = (primary.length - offset).min(chunk_size);
        Ok((offset, length as usize))
    }

    async fn read_once(
        &self,
        handle: &SourceHandle,
        key: &ChunkKey,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, ReadFault> {
        let ready = handle.is_ready();
        if ready {
            self.metrics.source_read();
        }

        match tokio::time::timeout(self.attempt_timeout, handle.read(offset, length)).await {
            Err(_) => Err(ReadFault::Timeout(self.attempt_timeout)),
            Ok(Ok(bytes)) if bytes.is_empty() => Err(ReadFault::EmptyRead),
            Ok(Ok(bytes)) if ready && bytes.len() < length => Err(ReadFault::StreamFault(format!(
                "short read: {} of {} bytes",
                bytes.len(),
                length
            ))),
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(SourceError::ConnectionFailed { reason, .. })) => {
                self.handles.invalidate(&key.item, &reason);
                Err(ReadFault::StreamFault(reason))
            }
            Ok(Err(e)) => Err(ReadFault::StreamFault(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::source::SourceDescriptor;
    use crate::store::MemoryChunkStore;
    use crate::testing::{MockFault, MockSource, MockTitle, pattern_bytes};

    const CHUNK: u64 = 1024;

    struct Fixture {
        extractor: ChunkExtractor,
        source: Arc<MockSource>,
        store: Arc<MemoryChunkStore>,
    }

    fn fixture(config: UndertowConfig, titles: &[(&str, MockTitle)]) -> Fixture {
        let source = Arc::new(MockSource::new());
        let catalog = Arc::new(ItemCatalog::new(config.source.default_chunk_size));
        for (name, title) in titles {
            source.add_title(name, title.clone());
            catalog.set_descriptor(
                &ItemId::from(*name),
                SourceDescriptor::Locator(format!("mock://{name}")),
            );
        }
        let handles = SourceHandleManager::new(source.clone(), catalog.clone(), &config.source);
        let store = Arc::new(MemoryChunkStore::new(64));
        let extractor = ChunkExtractor::new(&config, catalog, handles, store.clone());
        Fixture {
            extractor,
            source,
            store,
        }
    }

    fn default_config() -> UndertowConfig {
        let mut config = UndertowConfig::default();
        config.source.default_chunk_size = CHUNK as u32;
        config
    }

    #[tokio::test]
    async fn test_extracts_chunk_bytes() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);

        let bytes = f.extractor.extract(&ItemId::from("A"), 3).await.unwrap();

        assert_eq!(bytes, pattern_bytes(3 * CHUNK, CHUNK as usize));
        assert_eq!(f.source.read_count(), 1);
        assert_eq!(f.extractor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_last_chunk_is_short() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 2 * CHUNK + 10))]);
        let bytes = f.extractor.extract(&ItemId::from("A"), 2).await.unwrap();
        assert_eq!(bytes.len(), 10);
    }

    #[tokio::test]
    async fn test_store_hit_skips_source() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);
        let key = ChunkKey::new(ItemId::from("A"), 0);
        f.store.put(&key, Bytes::from_static(b"cached")).await.unwrap();

        let bytes = f.extractor.extract(&key.item, 0).await.unwrap();

        assert_eq!(bytes, Bytes::from_static(b"cached"));
        assert_eq!(f.source.open_count(), 0);
        assert_eq!(f.extractor.metrics().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_successful_extraction_is_persisted() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);
        let item = ItemId::from("A");

        f.extractor.extract(&item, 1).await.unwrap();
        f.extractor.extract(&item, 1).await.unwrap();

        assert!(f.store.contains(&ChunkKey::new(item, 1)).await.unwrap());
        assert_eq!(f.source.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_read() {
        let title = MockTitle::single("a.mp4", 10 * CHUNK).with_read_delay(Duration::from_millis(100));
        let f = fixture(default_config(), &[("A", title)]);
        let item = ItemId::from("A");

        let results =
            futures::future::join_all((0..10).map(|_| f.extractor.extract(&item, 4))).await;

        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|b| b.len() == CHUNK as usize)));
        assert_eq!(f.source.read_count(), 1);
        assert_eq!(f.extractor.metrics().source_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_item_cap_bounds_concurrency() {
        let title = MockTitle::single("a.mp4", 20 * CHUNK).with_read_delay(Duration::from_millis(50));
        let f = fixture(default_config(), &[("A", title)]);
        let item = ItemId::from("A");

        let results =
            futures::future::join_all((0..12).map(|index| f.extractor.extract(&item, index))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(f.source.max_concurrent_reads(), 3);
        assert_eq!(f.extractor.peak_extractions(&item), 3);
        assert_eq!(f.extractor.active_extractions(&item), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_is_not_retryable() {
        let f = fixture(default_config(), &[("B", MockTitle::single("b.mp4", 40 * CHUNK))]);

        let err = f.extractor.extract(&ItemId::from("B"), 50).await.unwrap_err();

        assert!(matches!(
            err,
            ExtractionError::OutOfRange {
                index: 50,
                total_chunks: 40,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert_eq!(f.source.read_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_descriptor_is_unavailable() {
        let f = fixture(default_config(), &[]);
        let err = f.extractor.extract(&ItemId::from("ghost"), 0).await.unwrap_err();
        assert!(matches!(err, ExtractionError::SourceUnavailable { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_faults_exhaust_retries_with_linear_backoff() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);
        f.source.script_faults("A", [MockFault::Error, MockFault::Error, MockFault::Error]);

        let start = Instant::now();
        let err = f.extractor.extract(&ItemId::from("A"), 0).await.unwrap_err();

        assert!(matches!(err, ExtractionError::RetriesExhausted { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(f.source.read_count(), 3);
        assert_eq!(f.extractor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_and_empty_reads_are_retried() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);
        f.source.script_faults("A", [MockFault::Hang, MockFault::Empty]);

        let start = Instant::now();
        let bytes = f.extractor.extract(&ItemId::from("A"), 0).await.unwrap();

        assert_eq!(bytes.len(), CHUNK as usize);
        // 15s attempt timeout, then 1s and 2s of backoff.
        assert_eq!(start.elapsed(), Duration::from_secs(18));
        assert_eq!(f.extractor.metrics().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_reopens_source() {
        let f = fixture(default_config(), &[("A", MockTitle::single("a.mp4", 10 * CHUNK))]);
        f.source.script_faults("A", [MockFault::ConnectionLost]);

        f.extractor.extract(&ItemId::from("A"), 0).await.unwrap();

        assert_eq!(f.source.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_reads_consume_attempts_by_default() {
        let mut config = default_config();
        config.source.readiness_timeout = Duration::from_secs(2);
        config.extraction.max_attempts = 1;
        let f = fixture(config, &[("A", MockTitle::single("a.mp4", 10 * CHUNK).never_ready())]);

        let err = f.extractor.extract(&ItemId::from("A"), 0).await.unwrap_err();

        assert!(matches!(
            err,
            ExtractionError::RetriesExhausted {
                last_fault: ReadFault::StreamFault(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_read_grace_waits_for_metadata() {
        let mut config = default_config();
        config.source.readiness_timeout = Duration::from_secs(2);
        config.source.unready_read_grace = 1;
        config.extraction.max_attempts = 1;
        let f = fixture(config, &[("A", MockTitle::single("a.mp4", 10 * CHUNK).never_ready())]);

        let extractor = f.extractor.clone();
        let pending = tokio::spawn(async move { extractor.extract(&ItemId::from("A"), 0).await });

        // Readiness gives up at 2s; the graced retry happens a second later.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        f.source.mark_ready("A");

        let bytes = pending.await.unwrap().unwrap();
        assert_eq!(bytes.len(), CHUNK as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_populates_store() {
        let title = MockTitle::single("a.mp4", 10 * CHUNK).with_read_delay(Duration::from_secs(1));
        let f = fixture(default_config(), &[("A", title)]);
        let item = ItemId::from("A");

        let abandoned = tokio::time::timeout(Duration::from_millis(10), f.extractor.extract(&item, 2)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.store.contains(&ChunkKey::new(item.clone(), 2)).await.unwrap());

        f.extractor.extract(&item, 2).await.unwrap();
        assert_eq!(f.source.read_count(), 1);
    }
}
