//! Test doubles for the upstream source.
//!
//! [`MockSource`] serves deterministic pattern bytes for registered titles and
//! lets tests script readiness, open failures and per-read faults while
//! counting what the core actually asked of it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::item::ItemId;
use crate::source::{MediaSource, SourceDescriptor, SourceError, SourceFile, SourceMetadata, SourceSession};

/// Byte stored at `offset` of every mock file.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Expected contents of a mock file range.
pub fn pattern_bytes(offset: u64, length: usize) -> Bytes {
    (0..length as u64)
        .map(|i| pattern_byte(offset + i))
        .collect::<Vec<u8>>()
        .into()
}

/// Scripted outcome for one range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// The read never completes
    Hang,
    /// The read returns zero bytes
    Empty,
    /// A transient stream error
    Error,
    /// The session drops and must be reopened
    ConnectionLost,
}

/// Files and behaviour of one mock title.
#[derive(Debug, Clone)]
pub struct MockTitle {
    files: Vec<SourceFile>,
    ready_delay: Duration,
    read_delay: Duration,
    ready: bool,
}

impl MockTitle {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files,
            ready_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
            ready: true,
        }
    }

    pub fn single(path: &str, length: u64) -> Self {
        Self::new(vec![SourceFile::new(path, length)])
    }

    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Metadata never arrives until [`MockSource::mark_ready`] is called.
    pub fn never_ready(mut self) -> Self {
        self.ready = false;
        self
    }
}

struct TitleState {
    files: Vec<SourceFile>,
    ready_delay: Duration,
    read_delay: Duration,
    ready: watch::Sender<bool>,
    faults: Mutex<VecDeque<MockFault>>,
    failing_opens: AtomicUsize,
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    active_reads: AtomicUsize,
    max_active_reads: AtomicUsize,
}

/// In-memory [`MediaSource`] keyed by item id.
#[derive(Default)]
pub struct MockSource {
    titles: Mutex<HashMap<String, Arc<TitleState>>>,
    counters: Arc<Counters>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_title(&self, item: &str, title: MockTitle) {
        let (ready, _) = watch::channel(title.ready);
        let state = TitleState {
            files: title.files,
            ready_delay: title.ready_delay,
            read_delay: title.read_delay,
            ready,
            faults: Mutex::new(VecDeque::new()),
            failing_opens: AtomicUsize::new(0),
        };
        self.titles.lock().insert(item.to_string(), Arc::new(state));
    }

    /// Queues faults consumed by the next reads of `item`, in order.
    pub fn script_faults(&self, item: &str, faults: impl IntoIterator<Item = MockFault>) {
        if let Some(title) = self.titles.lock().get(item) {
            title.faults.lock().extend(faults);
        }
    }

    /// Makes the next `count` opens of `item` fail.
    pub fn fail_next_opens(&self, item: &str, count: usize) {
        if let Some(title) = self.titles.lock().get(item) {
            title.failing_opens.store(count, Ordering::SeqCst);
        }
    }

    /// Lets metadata of a `never_ready` title arrive.
    pub fn mark_ready(&self, item: &str) {
        if let Some(title) = self.titles.lock().get(item) {
            title.ready.send_replace(true);
        }
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Range reads issued against any session.
    pub fn read_count(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    /// Highest number of reads observed in flight at once.
    pub fn max_concurrent_reads(&self) -> usize {
        self.counters.max_active_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn open(
        &self,
        item: &ItemId,
        _descriptor: &SourceDescriptor,
    ) -> Result<Arc<dyn SourceSession>, SourceError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);

        let title = self
            .titles
            .lock()
            .get(item.as_str())
            .cloned()
            .ok_or_else(|| SourceError::ConnectionFailed {
                item: item.clone(),
                reason: "unknown title".to_string(),
            })?;

        let should_fail = title
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(SourceError::ConnectionFailed {
                item: item.clone(),
                reason: "scripted open failure".to_string(),
            });
        }

        Ok(Arc::new(MockSession {
            item: item.clone(),
            title,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockSession {
    item: ItemId,
    title: Arc<TitleState>,
    counters: Arc<Counters>,
}

struct ActiveRead<'a>(&'a Counters);

impl<'a> ActiveRead<'a> {
    fn start(counters: &'a Counters) -> Self {
        let active = counters.active_reads.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active_reads.fetch_max(active, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveRead<'_> {
    fn drop(&mut self) {
        self.0.active_reads.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceSession for MockSession {
    async fn wait_ready(&self) -> Result<SourceMetadata, SourceError> {
        if !self.title.ready_delay.is_zero() {
            tokio::time::sleep(self.title.ready_delay).await;
        }

        let mut ready = self.title.ready.subscribe();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| SourceError::ConnectionFailed {
                item: self.item.clone(),
                reason: "session closed".to_string(),
            })?;

        Ok(SourceMetadata {
            files: self.title.files.clone(),
        })
    }

    fn metadata(&self) -> Option<SourceMetadata> {
        self.title.ready.borrow().then(|| SourceMetadata {
            files: self.title.files.clone(),
        })
    }

    async fn read_range(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SourceError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveRead::start(&self.counters);

        if !self.title.read_delay.is_zero() {
            tokio::time::sleep(self.title.read_delay).await;
        }

        let fault = self.title.faults.lock().pop_front();
        match fault {
            Some(MockFault::Hang) => futures::future::pending::<()>().await,
            Some(MockFault::Empty) => return Ok(Bytes::new()),
            Some(MockFault::Error) => {
                return Err(SourceError::ReadFailed {
                    reason: "scripted stream fault".to_string(),
                });
            }
            Some(MockFault::ConnectionLost) => {
                return Err(SourceError::ConnectionFailed {
                    item: self.item.clone(),
                    reason: "scripted connection loss".to_string(),
                });
            }
            None => {}
        }

        let file = self
            .title
            .files
            .get(file_index)
            .ok_or_else(|| SourceError::ReadFailed {
                reason: format!("no file at index {file_index}"),
            })?;

        if offset >= file.length {
            return Ok(Bytes::new());
        }
        let available = usize::try_from(file.length - offset).unwrap_or(usize::MAX);
        Ok(pattern_bytes(offset, length.min(available)))
    }
}
