//! Worker pool actor and its public handle.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::buffer::{BufferWrite, DeliveryBuffer};
use super::strategy::{StreamStrategy, StreamingStats};
use super::worker::{TaskOutcome, WorkerLink, WorkerReport, spawn_worker};
use super::{ChunkFetcher, ChunkTask, SchedulerError, StreamEvent};
use crate::config::SchedulerConfig;
use crate::item::ItemId;
use crate::registry::ClaimantId;

/// Task completion result
pub type TaskResult = Result<Bytes, SchedulerError>;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub respawning_workers: usize,
    pub queue_length: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub timed_out_tasks: u64,
    pub respawns: u64,
}

/// Command messages for the pool actor
enum PoolCommand {
    Submit {
        task: ChunkTask,
        /// `None` for chunks issued by a stream
        responder: Option<oneshot::Sender<TaskResult>>,
    },
    StartStream {
        item: ItemId,
        total_chunks: u32,
        hints: Vec<ClaimantId>,
        responder: oneshot::Sender<StreamStrategy>,
    },
    StopStream {
        item: ItemId,
        responder: oneshot::Sender<bool>,
    },
    Subscribe {
        item: ItemId,
        responder: oneshot::Sender<broadcast::Receiver<StreamEvent>>,
    },
    StreamingStats {
        item: ItemId,
        responder: oneshot::Sender<Option<StreamingStats>>,
    },
    BufferedChunk {
        item: ItemId,
        index: u32,
        responder: oneshot::Sender<Option<Bytes>>,
    },
    Stats {
        responder: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}

/// Handle to the worker pool actor.
///
/// Cheap to clone; the actor stops on [`WorkerPool::shutdown`] or once every
/// handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    worker_count: usize,
}

impl WorkerPool {
    /// Spawns the actor and its workers on the current runtime.
    pub fn new(config: SchedulerConfig, fetcher: Arc<dyn ChunkFetcher>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker_count = config.worker_count.max(1);

        let actor = PoolActor::new(config, fetcher, command_rx, commands.downgrade());
        tokio::spawn(actor.run());

        Self {
            commands,
            worker_count,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, SchedulerError> {
        let (responder, response) = oneshot::channel();
        self.commands
            .send(command(responder))
            .map_err(|_| SchedulerError::PoolShutdown)?;
        response.await.map_err(|_| SchedulerError::PoolShutdown)
    }

    /// Runs `task` on an idle worker, or queues it FIFO until one frees up.
    ///
    /// # Errors
    /// - `SchedulerError::WorkerTimeout` - Task exceeded the hard timeout
    /// - `SchedulerError::WorkerCrash` - The worker died while running it
    /// - `SchedulerError::Fetch` - The fetch itself failed
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn submit(&self, task: ChunkTask) -> TaskResult {
        self.request(|responder| PoolCommand::Submit {
            task,
            responder: Some(responder),
        })
        .await?
    }

    /// Submits a single chunk of `item`.
    ///
    /// # Errors
    /// Same as [`WorkerPool::submit`].
    pub async fn submit_chunk(
        &self,
        item: &ItemId,
        index: u32,
        hint_sources: Vec<ClaimantId>,
    ) -> TaskResult {
        self.submit(ChunkTask::new(item.clone(), index).with_hints(hint_sources))
            .await
    }

    /// Starts fetching every missing chunk of `item` in the background.
    ///
    /// Returns as soon as issuance is scheduled. Starting a stream that is
    /// still issuing returns its current strategy unchanged.
    ///
    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn start_stream(
        &self,
        item: &ItemId,
        total_chunks: u32,
        hint_sources: Vec<ClaimantId>,
    ) -> Result<StreamStrategy, SchedulerError> {
        self.request(|responder| PoolCommand::StartStream {
            item: item.clone(),
            total_chunks,
            hints: hint_sources,
            responder,
        })
        .await
    }

    /// Stops issuing chunks for `item` and closes its event channel.
    ///
    /// The delivery buffer is kept. Returns whether anything was stopped.
    ///
    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn stop_stream(&self, item: &ItemId) -> Result<bool, SchedulerError> {
        self.request(|responder| PoolCommand::StopStream {
            item: item.clone(),
            responder,
        })
        .await
    }

    /// Subscribes to `item`'s stream events. May be called before the
    /// stream starts.
    ///
    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn subscribe(
        &self,
        item: &ItemId,
    ) -> Result<broadcast::Receiver<StreamEvent>, SchedulerError> {
        self.request(|responder| PoolCommand::Subscribe {
            item: item.clone(),
            responder,
        })
        .await
    }

    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn streaming_stats(
        &self,
        item: &ItemId,
    ) -> Result<Option<StreamingStats>, SchedulerError> {
        self.request(|responder| PoolCommand::StreamingStats {
            item: item.clone(),
            responder,
        })
        .await
    }

    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn buffered_chunk(
        &self,
        item: &ItemId,
        index: u32,
    ) -> Result<Option<Bytes>, SchedulerError> {
        self.request(|responder| PoolCommand::BufferedChunk {
            item: item.clone(),
            index,
            responder,
        })
        .await
    }

    /// # Errors
    /// - `SchedulerError::PoolShutdown` - Pool no longer running
    pub async fn stats(&self) -> Result<PoolStats, SchedulerError> {
        self.request(|responder| PoolCommand::Stats { responder })
            .await
    }

    /// Stops the actor and its workers; pending tasks fail with
    /// `PoolShutdown`.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|responder| PoolCommand::Shutdown { responder })
            .await;
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

struct Assignment {
    task: ChunkTask,
    responder: Option<oneshot::Sender<TaskResult>>,
}

impl Assignment {
    fn from_stream(&self) -> bool {
        self.responder.is_none()
    }
}

enum WorkerState {
    Idle,
    Busy(Assignment),
    Respawning,
}

struct WorkerRecord {
    generation: u64,
    state: WorkerState,
    link: Option<WorkerLink>,
}

struct StreamState {
    buffer: DeliveryBuffer,
    strategy: StreamStrategy,
    stream_ready_sent: bool,
    issuer_stop: Option<watch::Sender<bool>>,
}

impl StreamState {
    fn new(total_chunks: u32, strategy: StreamStrategy) -> Self {
        Self {
            buffer: DeliveryBuffer::new(total_chunks),
            strategy,
            stream_ready_sent: false,
            issuer_stop: None,
        }
    }

    fn is_issuing(&self) -> bool {
        self.issuer_stop.as_ref().is_some_and(|stop| !stop.is_closed())
    }
}

#[derive(Default)]
struct Counters {
    completed: u64,
    failed: u64,
    timed_out: u64,
    respawns: u64,
}

/// Internal pool actor; sole owner of worker records, queue and buffers.
struct PoolActor {
    config: SchedulerConfig,
    fetcher: Arc<dyn ChunkFetcher>,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    self_commands: mpsc::WeakUnboundedSender<PoolCommand>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports: mpsc::UnboundedReceiver<WorkerReport>,
    workers: Vec<WorkerRecord>,
    queue: VecDeque<Assignment>,
    streams: HashMap<ItemId, StreamState>,
    events: HashMap<ItemId, broadcast::Sender<StreamEvent>>,
    counters: Counters,
}

impl PoolActor {
    fn new(
        config: SchedulerConfig,
        fetcher: Arc<dyn ChunkFetcher>,
        commands: mpsc::UnboundedReceiver<PoolCommand>,
        self_commands: mpsc::WeakUnboundedSender<PoolCommand>,
    ) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        Self {
            config,
            fetcher,
            commands,
            self_commands,
            reports_tx,
            reports,
            workers: Vec::new(),
            queue: VecDeque::new(),
            streams: HashMap::new(),
            events: HashMap::new(),
            counters: Counters::default(),
        }
    }

    async fn run(mut self) {
        let worker_count = self.config.worker_count.max(1);
        for slot in 0..worker_count {
            let link = self.spawn(slot, 0);
            self.workers.push(WorkerRecord {
                generation: 0,
                state: WorkerState::Idle,
                link: Some(link),
            });
        }
        tracing::info!("Worker pool started with {} workers", worker_count);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command) {
                                return;
                            }
                        }
                        None => break,
                    }
                }

                Some(report) = self.reports.recv() => {
                    self.handle_report(report);
                }
            }
        }

        self.teardown();
    }

    fn spawn(&self, slot: usize, generation: u64) -> WorkerLink {
        spawn_worker(
            slot,
            generation,
            Arc::clone(&self.fetcher),
            self.config.task_timeout,
            self.reports_tx.clone(),
        )
    }

    /// Returns `false` once the actor should stop.
    fn handle_command(&mut self, command: PoolCommand) -> bool {
        match command {
            PoolCommand::Submit { task, responder } => {
                self.queue.push_back(Assignment { task, responder });
                self.dispatch();
            }
            PoolCommand::StartStream {
                item,
                total_chunks,
                hints,
                responder,
            } => {
                let strategy = self.start_stream(item, total_chunks, hints);
                let _ = responder.send(strategy);
            }
            PoolCommand::StopStream { item, responder } => {
                let _ = responder.send(self.stop_stream(&item));
            }
            PoolCommand::Subscribe { item, responder } => {
                let capacity = self.config.event_capacity.max(1);
                let events = self
                    .events
                    .entry(item)
                    .or_insert_with(|| broadcast::channel(capacity).0);
                let _ = responder.send(events.subscribe());
            }
            PoolCommand::StreamingStats { item, responder } => {
                let stats = self.streams.get(&item).map(|stream| {
                    StreamingStats::derive(
                        &stream.buffer,
                        self.busy_workers(),
                        self.workers.len(),
                        self.queue.len(),
                    )
                });
                let _ = responder.send(stats);
            }
            PoolCommand::BufferedChunk {
                item,
                index,
                responder,
            } => {
                let chunk = self
                    .streams
                    .get(&item)
                    .and_then(|stream| stream.buffer.get(index).cloned());
                let _ = responder.send(chunk);
            }
            PoolCommand::Stats { responder } => {
                let _ = responder.send(self.stats());
            }
            PoolCommand::Shutdown { responder } => {
                self.teardown();
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    fn handle_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Finished {
                slot,
                generation,
                task_id,
                outcome,
            } => {
                let Some(worker) = self.workers.get_mut(slot) else {
                    return;
                };
                if worker.generation != generation {
                    return;
                }

                let assignment = match mem::replace(&mut worker.state, WorkerState::Idle) {
                    WorkerState::Busy(assignment) if assignment.task.id == task_id => assignment,
                    other => {
                        worker.state = other;
                        return;
                    }
                };

                self.finish(slot, assignment, outcome);
                self.dispatch();
            }
            WorkerReport::Crashed {
                slot,
                generation,
                reason,
            } => {
                let Some(worker) = self.workers.get_mut(slot) else {
                    return;
                };
                if worker.generation != generation {
                    return;
                }

                tracing::warn!("Worker {} crashed: {}", slot, reason);
                if let WorkerState::Busy(assignment) =
                    mem::replace(&mut worker.state, WorkerState::Respawning)
                {
                    self.counters.failed += 1;
                    self.reject(assignment, SchedulerError::WorkerCrash { slot });
                }
                self.begin_respawn(slot);
            }
            WorkerReport::RespawnDue { slot } => {
                let Some(generation) = self.workers.get(slot).map(|worker| worker.generation) else {
                    return;
                };
                let link = self.spawn(slot, generation);
                if let Some(worker) = self.workers.get_mut(slot) {
                    worker.link = Some(link);
                    worker.state = WorkerState::Idle;
                }
                self.counters.respawns += 1;
                tracing::info!("Worker {} respawned (generation {})", slot, generation);
                self.dispatch();
            }
        }
    }

    /// Assigns queued tasks until the queue is empty or no worker is idle.
    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(slot) = self
                .workers
                .iter()
                .position(|worker| matches!(worker.state, WorkerState::Idle))
            else {
                break;
            };
            let Some(assignment) = self.queue.pop_front() else {
                break;
            };
            self.assign(slot, assignment);
        }
    }

    fn assign(&mut self, slot: usize, assignment: Assignment) {
        let sent = self.workers[slot]
            .link
            .as_ref()
            .is_some_and(|link| link.inbox.send(assignment.task.clone()).is_ok());

        if !sent {
            tracing::warn!(
                "Worker {} is gone; requeueing {}#{}",
                slot,
                assignment.task.item,
                assignment.task.index
            );
            self.queue.push_front(assignment);
            self.begin_respawn(slot);
            return;
        }

        tracing::trace!(
            "Assigned {}#{} to worker {}",
            assignment.task.item,
            assignment.task.index,
            slot
        );
        self.emit(
            &assignment.task.item,
            StreamEvent::ChunkProgress {
                item: assignment.task.item.clone(),
                index: assignment.task.index,
                percent: 0,
            },
        );
        self.workers[slot].state = WorkerState::Busy(assignment);
    }

    fn begin_respawn(&mut self, slot: usize) {
        let Some(worker) = self.workers.get_mut(slot) else {
            return;
        };

        worker.state = WorkerState::Respawning;
        worker.generation += 1;
        if let Some(link) = worker.link.take() {
            link.abort.abort();
        }

        let reports = self.reports_tx.clone();
        let delay = self.config.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = reports.send(WorkerReport::RespawnDue { slot });
        });
    }

    fn finish(&mut self, slot: usize, assignment: Assignment, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(bytes) => {
                self.counters.completed += 1;
                self.deliver(&assignment.task, &bytes);
                if let Some(responder) = assignment.responder {
                    let _ = responder.send(Ok(bytes));
                }
            }
            TaskOutcome::Failed(e) => {
                self.counters.failed += 1;
                self.reject(assignment, SchedulerError::Fetch(e));
            }
            TaskOutcome::TimedOut => {
                self.counters.timed_out += 1;
                tracing::warn!(
                    "Worker {} timed out on {}#{} after {:?}",
                    slot,
                    assignment.task.item,
                    assignment.task.index,
                    self.config.task_timeout
                );
                self.reject(
                    assignment,
                    SchedulerError::WorkerTimeout {
                        slot,
                        after: self.config.task_timeout,
                    },
                );
            }
        }
    }

    fn reject(&self, assignment: Assignment, error: SchedulerError) {
        let task = &assignment.task;
        self.emit(
            &task.item,
            StreamEvent::ChunkFailed {
                item: task.item.clone(),
                index: task.index,
                error: error.to_string(),
                retryable: error.is_retryable(),
            },
        );
        if let Some(responder) = assignment.responder {
            let _ = responder.send(Err(error));
        }
    }

    /// Writes a completed chunk into its stream's buffer, if one exists.
    fn deliver(&mut self, task: &ChunkTask, bytes: &Bytes) {
        let Some(stream) = self.streams.get_mut(&task.item) else {
            return;
        };

        match stream.buffer.write(task.index, bytes.clone()) {
            BufferWrite::Stored => {}
            BufferWrite::Duplicate => return,
            BufferWrite::Conflict => {
                tracing::warn!(
                    "Chunk {}#{} completed with different bytes; keeping the first copy",
                    task.item,
                    task.index
                );
                return;
            }
            BufferWrite::OutOfBounds => {
                tracing::warn!(
                    "Chunk {}#{} is outside the stream's {} chunks",
                    task.item,
                    task.index,
                    stream.buffer.total_chunks()
                );
                return;
            }
        }

        let priority = stream.strategy.is_priority(task.index);
        self.emit(
            &task.item,
            StreamEvent::ChunkProgress {
                item: task.item.clone(),
                index: task.index,
                percent: 100,
            },
        );
        self.emit(
            &task.item,
            StreamEvent::ChunkReady {
                item: task.item.clone(),
                index: task.index,
                priority,
            },
        );
        self.check_stream_ready(&task.item);
    }

    fn check_stream_ready(&mut self, item: &ItemId) {
        let Some(stream) = self.streams.get_mut(item) else {
            return;
        };
        if stream.stream_ready_sent {
            return;
        }

        let priority_chunks = stream.strategy.priority_chunk_count;
        if !(0..priority_chunks).all(|index| stream.buffer.contains(index)) {
            return;
        }

        stream.stream_ready_sent = true;
        let event = StreamEvent::StreamReady {
            item: item.clone(),
            ready_chunks: stream.buffer.available(),
            total_chunks: stream.buffer.total_chunks(),
        };
        tracing::info!("Stream {} ready ({} priority chunks)", item, priority_chunks);
        self.emit(item, event);
    }

    fn start_stream(
        &mut self,
        item: ItemId,
        total_chunks: u32,
        hints: Vec<ClaimantId>,
    ) -> StreamStrategy {
        let strategy =
            StreamStrategy::plan(total_chunks, self.config.priority_chunks, self.workers.len());

        let stream = self
            .streams
            .entry(item.clone())
            .or_insert_with(|| StreamState::new(total_chunks, strategy));
        if stream.buffer.total_chunks() != total_chunks {
            *stream = StreamState::new(total_chunks, strategy);
        }

        if stream.is_issuing() {
            tracing::debug!("Stream {} already issuing chunks", item);
            return stream.strategy;
        }

        stream.strategy = strategy;
        let order = strategy.issue_order(&stream.buffer);
        let (stop_tx, stop_rx) = watch::channel(false);
        stream.issuer_stop = Some(stop_tx);

        tracing::info!(
            "Starting stream {}: {} priority + {} background chunks, {} to fetch",
            item,
            strategy.priority_chunk_count,
            strategy.background_chunk_count,
            order.len()
        );

        tokio::spawn(issue_chunks(
            self.self_commands.clone(),
            item.clone(),
            order,
            hints,
            stop_rx,
            self.config.priority_stagger,
            self.config.background_stagger,
        ));

        self.check_stream_ready(&item);
        strategy
    }

    fn stop_stream(&mut self, item: &ItemId) -> bool {
        let had_subscribers = self.events.remove(item).is_some();
        let Some(stream) = self.streams.get_mut(item) else {
            return had_subscribers;
        };

        if let Some(stop) = stream.issuer_stop.take() {
            let _ = stop.send(true);
        }

        let queued = self.queue.len();
        self.queue
            .retain(|assignment| !(assignment.from_stream() && assignment.task.item == *item));
        tracing::info!(
            "Stopped stream {} ({} queued chunks dropped)",
            item,
            queued - self.queue.len()
        );
        true
    }

    fn emit(&self, item: &ItemId, event: StreamEvent) {
        if let Some(events) = self.events.get(item) {
            let _ = events.send(event);
        }
    }

    fn busy_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|worker| matches!(worker.state, WorkerState::Busy(_)))
            .count()
    }

    fn stats(&self) -> PoolStats {
        let active_workers = self.busy_workers();
        let respawning_workers = self
            .workers
            .iter()
            .filter(|worker| matches!(worker.state, WorkerState::Respawning))
            .count();

        PoolStats {
            total_workers: self.workers.len(),
            active_workers,
            idle_workers: self.workers.len() - active_workers - respawning_workers,
            respawning_workers,
            queue_length: self.queue.len(),
            completed_tasks: self.counters.completed,
            failed_tasks: self.counters.failed,
            timed_out_tasks: self.counters.timed_out,
            respawns: self.counters.respawns,
        }
    }

    fn teardown(&mut self) {
        for stream in self.streams.values_mut() {
            if let Some(stop) = stream.issuer_stop.take() {
                let _ = stop.send(true);
            }
        }
        self.events.clear();

        for assignment in mem::take(&mut self.queue) {
            if let Some(responder) = assignment.responder {
                let _ = responder.send(Err(SchedulerError::PoolShutdown));
            }
        }

        for worker in &mut self.workers {
            if let WorkerState::Busy(assignment) = mem::replace(&mut worker.state, WorkerState::Idle)
            {
                if let Some(responder) = assignment.responder {
                    let _ = responder.send(Err(SchedulerError::PoolShutdown));
                }
            }
            if let Some(link) = worker.link.take() {
                link.abort.abort();
            }
        }

        tracing::info!("Worker pool shut down");
    }
}

/// Feeds a stream's chunks to the pool, priority chunks first.
async fn issue_chunks(
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
    item: ItemId,
    order: Vec<(u32, bool)>,
    hints: Vec<ClaimantId>,
    mut stop: watch::Receiver<bool>,
    priority_stagger: Duration,
    background_stagger: Duration,
) {
    for (position, (index, priority)) in order.into_iter().enumerate() {
        // The first chunk goes out immediately; later ones are spaced out
        let stagger = match (position, priority) {
            (0, _) => Duration::ZERO,
            (_, true) => priority_stagger,
            (_, false) => background_stagger,
        };

        tokio::select! {
            _ = stop.changed() => {
                tracing::debug!("Chunk issuance for {} stopped", item);
                return;
            }
            _ = tokio::time::sleep(stagger) => {}
        }

        let Some(commands) = commands.upgrade() else {
            return;
        };
        let task = ChunkTask::new(item.clone(), index)
            .with_priority(priority)
            .with_hints(hints.clone());
        if commands
            .send(PoolCommand::Submit {
                task,
                responder: None,
            })
            .is_err()
        {
            return;
        }
    }

    tracing::debug!("All chunks of {} issued", item);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::extraction::{ExtractionError, ReadFault};

    #[derive(Default)]
    struct MockFetcher {
        delay: Duration,
        hang_on: HashSet<u32>,
        panic_on: HashSet<u32>,
        fail_on: HashSet<u32>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ChunkFetcher for MockFetcher {
        async fn fetch(&self, task: &ChunkTask) -> Result<Bytes, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on.contains(&task.index) {
                panic!("simulated worker fault on chunk {}", task.index);
            }
            if self.hang_on.contains(&task.index) {
                futures::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;
            if self.fail_on.contains(&task.index) {
                return Err(ExtractionError::RetriesExhausted {
                    item: task.item.clone(),
                    index: task.index,
                    attempts: 3,
                    last_fault: ReadFault::EmptyRead,
                });
            }
            Ok(Bytes::from(format!("{}#{}", task.item, task.index)))
        }
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            worker_count: workers,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_stream_chunk_is_issued_without_stagger() {
        let config = SchedulerConfig {
            worker_count: 2,
            priority_stagger: Duration::from_secs(10),
            ..Default::default()
        };
        let pool = WorkerPool::new(config, Arc::new(MockFetcher::default()));
        let item = ItemId::from("A");
        let mut events = pool.subscribe(&item).await.unwrap();

        let start = Instant::now();
        pool.start_stream(&item, 2, Vec::new()).await.unwrap();

        let mut ready_at = Vec::new();
        while ready_at.len() < 2 {
            if let Ok(StreamEvent::ChunkReady { index, .. }) = events.recv().await {
                ready_at.push((index, start.elapsed()));
            }
        }

        assert_eq!(ready_at[0].0, 0);
        assert!(ready_at[0].1 < Duration::from_secs(1));
        assert_eq!(ready_at[1].0, 1);
        assert!(ready_at[1].1 >= Duration::from_secs(10));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_returns_fetched_bytes() {
        let pool = WorkerPool::new(config(2), Arc::new(MockFetcher::default()));

        let bytes = pool.submit_chunk(&ItemId::from("A"), 3, Vec::new()).await.unwrap();

        assert_eq!(bytes, Bytes::from_static(b"A#3"));
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.total_workers, 2);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drains_through_all_workers() {
        let pool = WorkerPool::new(config(2), Arc::new(MockFetcher::with_delay(Duration::from_secs(1))));
        let item = ItemId::from("A");

        let start = Instant::now();
        let results =
            futures::future::join_all((0..6).map(|index| pool.submit_chunk(&item, index, Vec::new())))
                .await;

        assert!(results.iter().all(Result::is_ok));
        // Six one-second tasks on two workers.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(pool.stats().await.unwrap().queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_task_times_out_and_frees_worker() {
        let fetcher = MockFetcher {
            delay: Duration::from_millis(10),
            hang_on: HashSet::from([0]),
            ..Default::default()
        };
        let pool = WorkerPool::new(config(1), Arc::new(fetcher));
        let item = ItemId::from("A");

        let (hung, second, third) = tokio::join!(
            pool.submit_chunk(&item, 0, Vec::new()),
            pool.submit_chunk(&item, 1, Vec::new()),
            pool.submit_chunk(&item, 2, Vec::new()),
        );

        let err = hung.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerTimeout { slot: 0, .. }));
        assert!(err.is_retryable());
        assert!(second.is_ok());
        assert!(third.is_ok());

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.timed_out_tasks, 1);
        assert_eq!(stats.idle_workers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_worker_is_respawned_in_same_slot() {
        let fetcher = MockFetcher {
            panic_on: HashSet::from([7]),
            ..Default::default()
        };
        let pool = WorkerPool::new(config(1), Arc::new(fetcher));
        let item = ItemId::from("A");

        let err = pool.submit_chunk(&item, 7, Vec::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerCrash { slot: 0 }));

        // Queued while the slot is respawning; runs once the new worker is up.
        let bytes = pool.submit_chunk(&item, 1, Vec::new()).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"A#1"));

        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.respawns, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.total_workers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_fills_buffer_and_reports_events() {
        let pool = WorkerPool::new(config(2), Arc::new(MockFetcher::with_delay(Duration::from_millis(100))));
        let item = ItemId::from("A");
        let mut events = pool.subscribe(&item).await.unwrap();

        let strategy = pool.start_stream(&item, 10, Vec::new()).await.unwrap();
        assert_eq!(strategy.priority_chunk_count, 5);
        assert_eq!(strategy.background_chunk_count, 5);
        assert_eq!(strategy.worker_count, 2);

        let mut ready = Vec::new();
        let mut stream_ready = 0;
        while ready.len() < 10 {
            match events.recv().await.unwrap() {
                StreamEvent::ChunkReady { index, priority, .. } => {
                    assert_eq!(priority, index < 5);
                    ready.push(index);
                }
                StreamEvent::StreamReady { total_chunks, .. } => {
                    assert_eq!(total_chunks, 10);
                    assert!(ready.len() >= 5);
                    stream_ready += 1;
                }
                _ => {}
            }
        }
        assert_eq!(stream_ready, 1);

        let stats = pool.streaming_stats(&item).await.unwrap().unwrap();
        assert_eq!(stats.available_chunks, 10);
        assert_eq!(stats.completed_percentage, "100.0");
        assert_eq!(
            pool.buffered_chunk(&item, 9).await.unwrap(),
            Some(Bytes::from_static(b"A#9"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_chunk_is_reported() {
        let fetcher = MockFetcher {
            fail_on: HashSet::from([1]),
            ..Default::default()
        };
        let pool = WorkerPool::new(config(2), Arc::new(fetcher));
        let item = ItemId::from("A");
        let mut events = pool.subscribe(&item).await.unwrap();

        pool.start_stream(&item, 3, Vec::new()).await.unwrap();

        let failed = loop {
            if let StreamEvent::ChunkFailed { index, retryable, .. } = events.recv().await.unwrap() {
                break (index, retryable);
            }
        };
        assert_eq!(failed, (1, true));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = pool.streaming_stats(&item).await.unwrap().unwrap();
        assert_eq!(stats.available_chunks, 2);
        assert_eq!(stats.completed_percentage, "66.7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_stream_closes_events_and_keeps_buffer() {
        let pool = WorkerPool::new(config(1), Arc::new(MockFetcher::with_delay(Duration::from_secs(1))));
        let item = ItemId::from("A");
        let mut events = pool.subscribe(&item).await.unwrap();

        pool.start_stream(&item, 20, Vec::new()).await.unwrap();
        loop {
            if let StreamEvent::ChunkReady { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        assert!(pool.stop_stream(&item).await.unwrap());
        loop {
            match events.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => {}
            }
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        let stats = pool.streaming_stats(&item).await.unwrap().unwrap();
        assert!(stats.available_chunks >= 1);
        assert!(stats.available_chunks < 20);
        assert_eq!(stats.queue_length, 0);
        assert!(pool.buffered_chunk(&item, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_stream_has_no_stats() {
        let pool = WorkerPool::new(config(2), Arc::new(MockFetcher::default()));
        assert!(pool.streaming_stats(&ItemId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let pool = WorkerPool::new(config(2), Arc::new(MockFetcher::default()));
        pool.shutdown().await;

        let result = pool.submit_chunk(&ItemId::from("A"), 0, Vec::new()).await;
        assert!(matches!(result, Err(SchedulerError::PoolShutdown)));
    }
}
