//! Lazily opened, per-item source handles with deduplicated acquisition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};

use super::{
    LargestMediaFile, MediaSource, PrimaryFileSelector, SourceDescriptor, SourceError,
    SourceMetadata, SourceSession,
};
use crate::config::SourceConfig;
use crate::item::{ItemCatalog, ItemId};

/// Lifecycle state of an item's source handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// An open/readiness attempt is in flight
    Acquiring,
    /// Metadata known and a primary file selected
    Ready,
    /// Readiness timed out; reads are attempted anyway
    BestEffort,
    /// The last acquisition failed or the handle was invalidated
    Failed,
}

/// The file of a source that chunks are cut from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryFile {
    pub index: usize,
    pub path: String,
    pub length: u64,
}

struct HandleInner {
    item: ItemId,
    session: Arc<dyn SourceSession>,
    primary: RwLock<Option<PrimaryFile>>,
}

/// Shared, read-only view of an open source session.
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<HandleInner>,
}

impl SourceHandle {
    fn new(item: ItemId, session: Arc<dyn SourceSession>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                item,
                session,
                primary: RwLock::new(None),
            }),
        }
    }

    pub fn item(&self) -> &ItemId {
        &self.inner.item
    }

    pub fn primary_file(&self) -> Option<PrimaryFile> {
        self.inner.primary.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.primary.read().is_some()
    }

    pub fn state(&self) -> HandleState {
        if self.is_ready() {
            HandleState::Ready
        } else {
            HandleState::BestEffort
        }
    }

    /// Reads a byte range of the primary file.
    ///
    /// # Errors
    /// - `SourceError::NotReady` - No primary file known yet
    /// - Any error reported by the session
    pub async fn read(&self, offset: u64, length: usize) -> Result<Bytes, SourceError> {
        let primary = self.primary_file().ok_or_else(|| SourceError::NotReady {
            item: self.inner.item.clone(),
        })?;
        self.inner
            .session
            .read_range(primary.index, offset, length)
            .await
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("item", &self.inner.item)
            .field("primary", &*self.inner.primary.read())
            .finish()
    }
}

type AcquireFuture = Shared<BoxFuture<'static, Result<SourceHandle, SourceError>>>;

enum Slot {
    Acquiring(AcquireFuture),
    Open(SourceHandle),
    Failed(SourceError),
}

struct ManagerInner {
    source: Arc<dyn MediaSource>,
    catalog: Arc<ItemCatalog>,
    selector: Arc<dyn PrimaryFileSelector>,
    readiness_timeout: Duration,
    slots: Mutex<HashMap<ItemId, Slot>>,
}

impl ManagerInner {
    async fn open_handle(
        &self,
        item: &ItemId,
        descriptor: &SourceDescriptor,
    ) -> Result<SourceHandle, SourceError> {
        tracing::info!("Opening source {} for {}", descriptor, item);

        let session = self.source.open(item, descriptor).await.inspect_err(|e| {
            tracing::warn!("Opening source for {} failed: {}", item, e);
        })?;
        let handle = SourceHandle::new(item.clone(), Arc::clone(&session));

        match tokio::time::timeout(self.readiness_timeout, session.wait_ready()).await {
            Ok(Ok(metadata)) => {
                let primary = self.promote(&handle, &metadata)?;
                tracing::info!(
                    "Source for {} ready: {} ({} bytes)",
                    item,
                    primary.path,
                    primary.length
                );
            }
            Ok(Err(e)) => {
                tracing::warn!("Source for {} failed before becoming ready: {}", item, e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    "Source for {} not ready after {:?}; continuing best-effort",
                    item,
                    self.readiness_timeout
                );
            }
        }

        Ok(handle)
    }

    fn promote(
        &self,
        handle: &SourceHandle,
        metadata: &SourceMetadata,
    ) -> Result<PrimaryFile, SourceError> {
        let no_primary = || SourceError::NoPrimaryFile {
            item: handle.item().clone(),
        };

        let index = self.selector.select(&metadata.files).ok_or_else(no_primary)?;
        let file = metadata.files.get(index).ok_or_else(no_primary)?;

        let primary = PrimaryFile {
            index,
            path: file.path.clone(),
            length: file.length,
        };

        self.catalog
            .apply_source_metadata(handle.item(), file.length, &file.path);
        *handle.inner.primary.write() = Some(primary.clone());

        Ok(primary)
    }

    fn settle(&self, item: &ItemId, result: &Result<SourceHandle, SourceError>) {
        let slot = match result {
            Ok(handle) => Slot::Open(handle.clone()),
            Err(e) => Slot::Failed(e.clone()),
        };
        self.slots.lock().insert(item.clone(), slot);
    }
}

/// Owns every item's source handle.
///
/// At most one acquisition per item is in flight; concurrent callers attach
/// to it. Acquisitions run on their own task so a caller giving up does not
/// cancel the attempt for everybody else.
#[derive(Clone)]
pub struct SourceHandleManager {
    inner: Arc<ManagerInner>,
}

impl SourceHandleManager {
    /// Creates a manager selecting primary files with [`LargestMediaFile`].
    pub fn new(source: Arc<dyn MediaSource>, catalog: Arc<ItemCatalog>, config: &SourceConfig) -> Self {
        Self::with_selector(source, catalog, Arc::new(LargestMediaFile), config)
    }

    pub fn with_selector(
        source: Arc<dyn MediaSource>,
        catalog: Arc<ItemCatalog>,
        selector: Arc<dyn PrimaryFileSelector>,
        config: &SourceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                source,
                catalog,
                selector,
                readiness_timeout: config.readiness_timeout,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the item's handle, opening the source if needed.
    ///
    /// A handle that missed the readiness timeout is returned in
    /// [`HandleState::BestEffort`] rather than failing.
    ///
    /// # Errors
    /// - `SourceError::NoDescriptor` - Nothing is known about how to reach the item
    /// - `SourceError::ConnectionFailed` - Opening failed; the next call retries
    /// - `SourceError::NoPrimaryFile` - The source holds nothing playable
    pub async fn acquire(&self, item: &ItemId) -> Result<SourceHandle, SourceError> {
        if let Some(handle) = self.cached(item) {
            if !handle.is_ready() {
                self.refresh(&handle);
            }
            return Ok(handle);
        }

        let pending = {
            let mut slots = self.inner.slots.lock();
            match slots.get(item) {
                Some(Slot::Open(handle)) => return Ok(handle.clone()),
                Some(Slot::Acquiring(pending)) => {
                    tracing::debug!("Joining in-flight source acquisition for {}", item);
                    pending.clone()
                }
                Some(Slot::Failed(_)) | None => {
                    let descriptor = self.inner.catalog.descriptor(item).ok_or_else(|| {
                        SourceError::NoDescriptor { item: item.clone() }
                    })?;
                    let pending = self.start_acquisition(item.clone(), descriptor);
                    slots.insert(item.clone(), Slot::Acquiring(pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    /// Stores `descriptor` for the item and acquires its handle.
    ///
    /// # Errors
    /// Same as [`SourceHandleManager::acquire`].
    pub async fn acquire_with(
        &self,
        item: &ItemId,
        descriptor: SourceDescriptor,
    ) -> Result<SourceHandle, SourceError> {
        self.inner.catalog.set_descriptor(item, descriptor);
        self.acquire(item).await
    }

    fn start_acquisition(&self, item: ItemId, descriptor: SourceDescriptor) -> AcquireFuture {
        let inner = Arc::clone(&self.inner);
        let task_item = item.clone();

        let task = tokio::spawn(async move {
            let result = inner.open_handle(&task_item, &descriptor).await;
            inner.settle(&task_item, &result);
            result
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let result = Err(SourceError::ConnectionFailed {
                        item: item.clone(),
                        reason: format!("acquisition task aborted: {e}"),
                    });
                    inner.settle(&item, &result);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Promotes a best-effort handle once its session reports metadata.
    ///
    /// Returns the primary file when the handle is (now) ready.
    pub fn refresh(&self, handle: &SourceHandle) -> Option<PrimaryFile> {
        if let Some(primary) = handle.primary_file() {
            return Some(primary);
        }

        let metadata = handle.inner.session.metadata()?;
        match self.inner.promote(handle, &metadata) {
            Ok(primary) => {
                tracing::info!("Best-effort source for {} became ready", handle.item());
                Some(primary)
            }
            Err(e) => {
                tracing::warn!("Source for {} reported unusable metadata: {}", handle.item(), e);
                None
            }
        }
    }

    /// Marks an open handle as failed so the next `acquire` reopens it.
    pub fn invalidate(&self, item: &ItemId, reason: &str) {
        let mut slots = self.inner.slots.lock();
        if matches!(slots.get(item), Some(Slot::Open(_))) {
            tracing::warn!("Invalidating source handle for {}: {}", item, reason);
            slots.insert(
                item.clone(),
                Slot::Failed(SourceError::ConnectionFailed {
                    item: item.clone(),
                    reason: reason.to_string(),
                }),
            );
        }
    }

    pub fn state(&self, item: &ItemId) -> Option<HandleState> {
        self.inner.slots.lock().get(item).map(|slot| match slot {
            Slot::Acquiring(_) => HandleState::Acquiring,
            Slot::Open(handle) => handle.state(),
            Slot::Failed(_) => HandleState::Failed,
        })
    }

    /// The cached handle, if one is open.
    pub fn cached(&self, item: &ItemId) -> Option<SourceHandle> {
        match self.inner.slots.lock().get(item) {
            Some(Slot::Open(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Last acquisition error, if the item's handle is in the failed state.
    pub fn last_error(&self, item: &ItemId) -> Option<SourceError> {
        match self.inner.slots.lock().get(item) {
            Some(Slot::Failed(e)) => Some(e.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::source::SourceFile;
    use crate::testing::{MockSource, MockTitle};

    fn config() -> SourceConfig {
        SourceConfig {
            readiness_timeout: Duration::from_secs(60),
            default_chunk_size: 1024,
            unready_read_grace: 0,
        }
    }

    fn setup(source: MockSource) -> (SourceHandleManager, Arc<ItemCatalog>, Arc<MockSource>) {
        let source = Arc::new(source);
        let catalog = Arc::new(ItemCatalog::new(1024));
        let manager = SourceHandleManager::new(source.clone(), catalog.clone(), &config());
        (manager, catalog, source)
    }

    fn locator(name: &str) -> SourceDescriptor {
        SourceDescriptor::Locator(format!("mock://{name}"))
    }

    #[tokio::test]
    async fn test_acquire_without_descriptor_fails() {
        let (manager, _, _) = setup(MockSource::new());
        let result = manager.acquire(&ItemId::from("unknown")).await;
        assert!(matches!(result, Err(SourceError::NoDescriptor { .. })));
    }

    #[tokio::test]
    async fn test_ready_handle_updates_catalog() {
        let (manager, catalog, source) = setup(MockSource::new());
        source.add_title("A", MockTitle::new(vec![
            SourceFile::new("a/sample.mp4", 100),
            SourceFile::new("a/movie.mkv", 10 * 1024),
        ]));

        let handle = manager.acquire_with(&ItemId::from("A"), locator("A")).await.unwrap();

        assert_eq!(handle.state(), HandleState::Ready);
        assert_eq!(handle.primary_file().unwrap().index, 1);
        let info = catalog.info(&ItemId::from("A")).unwrap();
        assert_eq!(info.file_size, 10 * 1024);
        assert_eq!(info.total_chunks, 10);
        assert!(info.metadata_known);
        assert_eq!(manager.state(&ItemId::from("A")), Some(HandleState::Ready));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_once() {
        let (manager, catalog, source) = setup(MockSource::new());
        source.add_title(
            "A",
            MockTitle::single("a.mp4", 4096).with_ready_delay(Duration::from_millis(20)),
        );
        catalog.set_descriptor(&ItemId::from("A"), locator("A"));

        let item = ItemId::from("A");
        let results = futures::future::join_all((0..8).map(|_| manager.acquire(&item))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(source.open_count(), 1);

        manager.acquire(&item).await.unwrap();
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_yields_best_effort_handle() {
        let (manager, catalog, source) = setup(MockSource::new());
        source.add_title("A", MockTitle::single("a.mp4", 4096).never_ready());

        let handle = manager.acquire_with(&ItemId::from("A"), locator("A")).await.unwrap();

        assert_eq!(handle.state(), HandleState::BestEffort);
        assert!(!catalog.info(&ItemId::from("A")).unwrap().metadata_known);
        assert!(matches!(handle.read(0, 10).await, Err(SourceError::NotReady { .. })));

        // Metadata arrives later; refresh promotes the same handle.
        source.mark_ready("A");
        let primary = manager.refresh(&handle).unwrap();
        assert_eq!(primary.length, 4096);
        assert_eq!(handle.state(), HandleState::Ready);
        assert_eq!(catalog.info(&ItemId::from("A")).unwrap().total_chunks, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_promotes_cached_best_effort_handle() {
        let (manager, catalog, source) = setup(MockSource::new());
        source.add_title("A", MockTitle::single("a.mp4", 4096).never_ready());
        let item = ItemId::from("A");

        manager.acquire_with(&item, locator("A")).await.unwrap();
        assert_eq!(manager.state(&item), Some(HandleState::BestEffort));

        source.mark_ready("A");
        let handle = manager.acquire(&item).await.unwrap();

        assert_eq!(handle.state(), HandleState::Ready);
        assert_eq!(catalog.info(&item).unwrap().total_chunks, 4);
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_evicted_and_retried() {
        let (manager, _, source) = setup(MockSource::new());
        source.add_title("A", MockTitle::single("a.mp4", 4096));
        source.fail_next_opens("A", 1);

        let item = ItemId::from("A");
        let first = manager.acquire_with(&item, locator("A")).await;
        assert!(matches!(first, Err(SourceError::ConnectionFailed { .. })));
        assert_eq!(manager.state(&item), Some(HandleState::Failed));
        assert!(manager.last_error(&item).is_some());

        let second = manager.acquire(&item).await;
        assert!(second.is_ok());
        assert_eq!(source.open_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reopen() {
        let (manager, _, source) = setup(MockSource::new());
        source.add_title("A", MockTitle::single("a.mp4", 4096));
        let item = ItemId::from("A");

        manager.acquire_with(&item, locator("A")).await.unwrap();
        manager.invalidate(&item, "peer swarm lost");
        assert!(manager.cached(&item).is_none());

        manager.acquire(&item).await.unwrap();
        assert_eq!(source.open_count(), 2);
    }
}
