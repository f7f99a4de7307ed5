//! Worker tasks and their crash watchers.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{ChunkFetcher, ChunkTask, TaskId};
use crate::extraction::ExtractionError;

/// How a worker finished its task.
#[derive(Debug)]
pub(super) enum TaskOutcome {
    Completed(Bytes),
    Failed(ExtractionError),
    TimedOut,
}

/// Messages from workers (and respawn timers) to the pool actor.
#[derive(Debug)]
pub(super) enum WorkerReport {
    Finished {
        slot: usize,
        generation: u64,
        task_id: TaskId,
        outcome: TaskOutcome,
    },
    Crashed {
        slot: usize,
        generation: u64,
        reason: String,
    },
    RespawnDue {
        slot: usize,
    },
}

/// Actor-side handle to a running worker.
pub(super) struct WorkerLink {
    pub(super) inbox: mpsc::UnboundedSender<ChunkTask>,
    pub(super) abort: AbortHandle,
}

/// Starts the worker for `slot` and a watcher reporting abnormal exits.
pub(super) fn spawn_worker(
    slot: usize,
    generation: u64,
    fetcher: Arc<dyn ChunkFetcher>,
    task_timeout: Duration,
    reports: mpsc::UnboundedSender<WorkerReport>,
) -> WorkerLink {
    let (inbox, tasks) = mpsc::unbounded_channel();

    let worker = tokio::spawn(run_worker(
        slot,
        generation,
        fetcher,
        task_timeout,
        tasks,
        reports.clone(),
    ));
    let abort = worker.abort_handle();

    tokio::spawn(async move {
        if let Err(e) = worker.await {
            if e.is_panic() {
                tracing::error!("Worker {} (generation {}) panicked", slot, generation);
            }
            let _ = reports.send(WorkerReport::Crashed {
                slot,
                generation,
                reason: e.to_string(),
            });
        }
    });

    tracing::debug!("Worker {} started (generation {})", slot, generation);
    WorkerLink { inbox, abort }
}

async fn run_worker(
    slot: usize,
    generation: u64,
    fetcher: Arc<dyn ChunkFetcher>,
    task_timeout: Duration,
    mut tasks: mpsc::UnboundedReceiver<ChunkTask>,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    while let Some(task) = tasks.recv().await {
        tracing::trace!("Worker {} fetching {}#{}", slot, task.item, task.index);

        // On timeout only this worker's wait is abandoned; the fetch itself
        // may keep running elsewhere.
        let outcome = match tokio::time::timeout(task_timeout, fetcher.fetch(&task)).await {
            Ok(Ok(bytes)) => TaskOutcome::Completed(bytes),
            Ok(Err(e)) => TaskOutcome::Failed(e),
            Err(_) => TaskOutcome::TimedOut,
        };

        let report = WorkerReport::Finished {
            slot,
            generation,
            task_id: task.id,
            outcome,
        };
        if reports.send(report).is_err() {
            break;
        }
    }

    tracing::trace!("Worker {} (generation {}) exiting", slot, generation);
}
