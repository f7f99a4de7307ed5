//! Boundary facade wiring every subsystem together.
//!
//! The transport layer (HTTP, WebSocket, ...) talks to a single
//! [`ChunkService`]; nothing here knows about wire formats beyond the
//! `Serialize` derives on the returned snapshots.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::UndertowConfig;
use crate::extraction::{ChunkExtractor, ExtractionMetrics};
use crate::item::{ItemCatalog, ItemId, ItemInfo};
use crate::registry::{ClaimRegistry, ClaimantId, Janitor, JanitorHandle, RegistryStats};
use crate::scheduler::{PoolStats, StreamEvent, StreamStrategy, StreamingStats, WorkerPool};
use crate::source::{HandleState, MediaSource, SourceDescriptor, SourceHandleManager};
use crate::store::ChunkStore;
use crate::{Result, UndertowError};

/// Chunk delivery core: claims, extraction and parallel streaming.
pub struct ChunkService {
    catalog: Arc<ItemCatalog>,
    registry: Arc<ClaimRegistry>,
    janitor: Mutex<Option<JanitorHandle>>,
    handles: SourceHandleManager,
    extractor: ChunkExtractor,
    pool: WorkerPool,
}

impl ChunkService {
    /// Builds every component and starts the janitor and worker pool on the
    /// current runtime.
    pub fn new(
        config: UndertowConfig,
        source: Arc<dyn MediaSource>,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        let catalog = Arc::new(ItemCatalog::new(config.source.default_chunk_size));
        let registry = Arc::new(ClaimRegistry::new());
        let janitor = Janitor::new(Arc::clone(&registry), &config.registry).spawn();

        let handles = SourceHandleManager::new(source, Arc::clone(&catalog), &config.source);
        let extractor = ChunkExtractor::new(&config, Arc::clone(&catalog), handles.clone(), store);
        let pool = WorkerPool::new(config.scheduler.clone(), Arc::new(extractor.clone()));

        tracing::info!(
            "Chunk service started: {} workers, {} extractions per item",
            pool.worker_count(),
            config.extraction.max_concurrent_per_item
        );

        Self {
            catalog,
            registry,
            janitor: Mutex::new(Some(janitor)),
            handles,
            extractor,
            pool,
        }
    }

    /// Records how to reach an item's upstream source.
    ///
    /// # Errors
    /// - `UndertowError::Source` - Descriptor is empty or an invalid magnet URI
    pub fn register_source(&self, item: &ItemId, descriptor: &str) -> Result<SourceDescriptor> {
        let descriptor = SourceDescriptor::parse(descriptor)?;
        tracing::debug!("Registered source {} for {}", descriptor, item);
        self.catalog.set_descriptor(item, descriptor.clone());
        Ok(descriptor)
    }

    /// Overrides an item's chunk size; ignored once metadata is known.
    pub fn set_chunk_size(&self, item: &ItemId, chunk_size: u32) -> bool {
        self.catalog.set_chunk_size(item, chunk_size)
    }

    pub fn register_claim(&self, item: &ItemId, index: u32, claimant: &ClaimantId) {
        self.catalog.touch(item);
        self.registry.register_claim(item, index, claimant);
    }

    pub fn get_claimants(&self, item: &ItemId, index: u32) -> Vec<ClaimantId> {
        self.registry.get_claimants(item, index)
    }

    /// Returns the number of claims dropped.
    pub fn remove_claimant(&self, claimant: &ClaimantId) -> usize {
        self.registry.remove_claimant(claimant)
    }

    /// Item geometry, acquiring the source first when metadata is unknown
    /// and a descriptor is registered.
    ///
    /// # Errors
    /// - `UndertowError::Source` - The source could not be acquired
    pub async fn get_item_info(&self, item: &ItemId) -> Result<ItemInfo> {
        let info = self.catalog.touch(item);
        if info.metadata_known || self.catalog.descriptor(item).is_none() {
            return Ok(info);
        }

        self.handles.acquire(item).await?;
        Ok(self.catalog.touch(item))
    }

    /// # Errors
    /// - `UndertowError::Extraction` - See [`crate::extraction::ExtractionError`]
    pub async fn extract_chunk(&self, item: &ItemId, index: u32) -> Result<Bytes> {
        let claimants = self.registry.get_claimants(item, index);
        if !claimants.is_empty() {
            tracing::debug!("{} claimants hold {}#{}", claimants.len(), item, index);
        }

        Ok(self.extractor.extract(item, index).await?)
    }

    /// Starts parallel acquisition of every chunk of `item`.
    ///
    /// # Errors
    /// - `UndertowError::Source` - The source could not be acquired
    /// - `UndertowError::MetadataUnavailable` - Chunk count still unknown
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn start_parallel_stream(
        &self,
        item: &ItemId,
        hint_sources: Vec<ClaimantId>,
    ) -> Result<StreamStrategy> {
        let info = self.get_item_info(item).await?;
        if !info.metadata_known {
            return Err(UndertowError::MetadataUnavailable { item: item.clone() });
        }

        Ok(self
            .pool
            .start_stream(item, info.total_chunks, hint_sources)
            .await?)
    }

    /// `None` if no stream was ever started for `item`.
    ///
    /// # Errors
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn get_streaming_stats(&self, item: &ItemId) -> Result<Option<StreamingStats>> {
        Ok(self.pool.streaming_stats(item).await?)
    }

    /// # Errors
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn subscribe(&self, item: &ItemId) -> Result<broadcast::Receiver<StreamEvent>> {
        Ok(self.pool.subscribe(item).await?)
    }

    /// # Errors
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn stop_stream(&self, item: &ItemId) -> Result<bool> {
        Ok(self.pool.stop_stream(item).await?)
    }

    /// # Errors
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn buffered_chunk(&self, item: &ItemId, index: u32) -> Result<Option<Bytes>> {
        Ok(self.pool.buffered_chunk(item, index).await?)
    }

    /// # Errors
    /// - `UndertowError::Scheduler` - Worker pool is shut down
    pub async fn pool_stats(&self) -> Result<PoolStats> {
        Ok(self.pool.stats().await?)
    }

    pub fn extraction_metrics(&self) -> ExtractionMetrics {
        self.extractor.metrics()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn handle_state(&self, item: &ItemId) -> Option<HandleState> {
        self.handles.state(item)
    }

    /// Stops the janitor and the worker pool.
    pub async fn shutdown(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.shutdown().await;
        }
        self.pool.shutdown().await;
        tracing::info!("Chunk service stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryChunkStore;
    use crate::testing::{MockSource, MockTitle};

    fn service(source: Arc<MockSource>) -> ChunkService {
        ChunkService::new(
            UndertowConfig::for_testing(),
            source,
            Arc::new(MemoryChunkStore::new(64)),
        )
    }

    #[tokio::test]
    async fn test_item_info_acquires_source_lazily() {
        let source = Arc::new(MockSource::new());
        source.add_title("A", MockTitle::single("a.mkv", 4096 + 1));
        let service = service(source.clone());
        let item = ItemId::from("A");

        let unknown = service.get_item_info(&item).await.unwrap();
        assert!(!unknown.metadata_known);
        assert_eq!(source.open_count(), 0);

        service.register_source(&item, "mock://A").unwrap();
        let info = service.get_item_info(&item).await.unwrap();

        assert!(info.metadata_known);
        assert_eq!(info.total_chunks, 5);
        assert_eq!(info.mime_type, "video/x-matroska");
        assert_eq!(service.handle_state(&item), Some(HandleState::Ready));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_claims_round_trip() {
        let service = service(Arc::new(MockSource::new()));
        let item = ItemId::from("A");
        let peer = ClaimantId::from("peer-1");

        service.register_claim(&item, 2, &peer);
        assert_eq!(service.get_claimants(&item, 2), vec![peer.clone()]);
        assert_eq!(service.remove_claimant(&peer), 1);
        assert!(service.get_claimants(&item, 2).is_empty());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_without_metadata_is_rejected() {
        let service = service(Arc::new(MockSource::new()));
        let result = service.start_parallel_stream(&ItemId::from("A"), Vec::new()).await;
        assert!(matches!(result, Err(UndertowError::MetadataUnavailable { .. })));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_a_user_error() {
        let service = service(Arc::new(MockSource::new()));
        let err = service
            .register_source(&ItemId::from("A"), "magnet:?xt=urn:btih:zz")
            .unwrap_err();
        assert!(err.is_user_error());
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_after_shutdown_fail() {
        let service = service(Arc::new(MockSource::new()));
        service.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = service.pool_stats().await;
        assert!(matches!(result, Err(UndertowError::Scheduler(_))));
    }
}
