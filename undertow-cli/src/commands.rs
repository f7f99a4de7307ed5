//! CLI command implementations

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Subcommand;
use serde_json::json;
use sha1::{Digest, Sha1};
use tokio::sync::broadcast::error::RecvError;
use undertow_core::config::UndertowConfig;
use undertow_core::source::SimulatedSource;
use undertow_core::store::store_from_config;
use undertow_core::{ChunkService, ClaimantId, ItemId, StreamEvent};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List the titles offered by the simulated source
    Titles,
    /// Download a whole title through the worker pool
    Stream {
        /// Title name, e.g. "Sintel"
        title: String,
        #[command(flatten)]
        sim: SimulationArgs,
        /// Override the worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Extract individual chunks on demand
    Extract {
        title: String,
        /// Chunk indices to extract
        #[arg(required = true)]
        indices: Vec<u32>,
        #[command(flatten)]
        sim: SimulationArgs,
    },
    /// Register synthetic peer claims and print who holds what
    Claims {
        title: String,
        /// Number of simulated peers
        #[arg(short, long, default_value = "4")]
        peers: usize,
        /// Number of leading chunks to claim
        #[arg(short, long, default_value = "8")]
        chunks: u32,
    },
}

/// Knobs for the simulated source shared by the data-moving commands
#[derive(clap::Args)]
pub struct SimulationArgs {
    /// Seed for latency and fault injection
    #[arg(long, default_value = "42")]
    seed: u64,
    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u32>,
    /// Probability that a range read fails transiently
    #[arg(long, default_value = "0.0")]
    fault_rate: f64,
    /// Upper bound of per-read latency in milliseconds
    #[arg(long, default_value = "20")]
    latency_ms: u64,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Titles => list_titles(),
        Commands::Stream {
            title,
            sim,
            workers,
        } => stream_title(title, sim, workers).await,
        Commands::Extract {
            title,
            indices,
            sim,
        } => extract_chunks(title, indices, sim).await,
        Commands::Claims {
            title,
            peers,
            chunks,
        } => show_claims(title, peers, chunks).await,
    }
}

fn list_titles() -> anyhow::Result<()> {
    let source = SimulatedSource::demo(0);
    for title in source.titles() {
        let bytes: u64 = title.files.iter().map(|file| file.length).sum();
        println!("{:<16} {:>10} bytes  {}", title.name, bytes, title.locator());
    }
    Ok(())
}

/// Builds a service over the demo source with `title` registered.
fn build_service(
    title: &str,
    sim: &SimulationArgs,
    workers: Option<usize>,
) -> anyhow::Result<(ChunkService, ItemId)> {
    let source = SimulatedSource::demo(sim.seed)
        .with_read_latency(Duration::ZERO, Duration::from_millis(sim.latency_ms))
        .with_fault_rate(sim.fault_rate);
    let locator = source
        .title(title)
        .map(|t| t.locator())
        .with_context(|| format!("unknown title {title:?}; see `undertow titles`"))?;

    let mut config = UndertowConfig::from_env();
    if let Some(chunk_size) = sim.chunk_size {
        config.source.default_chunk_size = chunk_size.max(1);
    }
    if let Some(workers) = workers {
        config.scheduler.worker_count = workers.max(1);
    }

    let store = store_from_config(&config.storage);
    let service = ChunkService::new(config, Arc::new(source), store);
    let item = ItemId::from(title);
    service.register_source(&item, &locator)?;

    Ok((service, item))
}

/// Stream a title and report progress until every chunk settled
///
/// # Errors
/// - Unknown title, source acquisition failure or pool shutdown
pub async fn stream_title(
    title: String,
    sim: SimulationArgs,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let (service, item) = build_service(&title, &sim, workers)?;
    let mut events = service.subscribe(&item).await?;

    let strategy = service.start_parallel_stream(&item, Vec::new()).await?;
    let total = strategy.priority_chunk_count + strategy.background_chunk_count;
    println!("{}", serde_json::to_string_pretty(&strategy)?);

    let mut progress = StreamProgress::new(total);
    let mut poll = tokio::time::interval(Duration::from_secs(1));

    while !progress.is_settled() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StreamEvent::ChunkReady { .. }) => progress.ready += 1,
                Ok(StreamEvent::ChunkFailed { index, error, .. }) => {
                    progress.failed += 1;
                    tracing::warn!("Chunk {} failed: {}", index, error);
                }
                Ok(StreamEvent::StreamReady { ready_chunks, .. }) => {
                    println!("Playback can start ({ready_chunks} priority chunks ready)");
                }
                Ok(StreamEvent::ChunkProgress { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event receiver lagged by {}", skipped);
                    resync_progress(&service, &item, &mut progress).await?;
                }
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => {
                resync_progress(&service, &item, &mut progress).await?;
            }
        }
    }

    let stats = service
        .get_streaming_stats(&item)
        .await?
        .context("stream disappeared")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.available_chunks == stats.total_chunks {
        let mut hasher = Sha1::new();
        for index in 0..stats.total_chunks {
            if let Some(chunk) = service.buffered_chunk(&item, index).await? {
                hasher.update(&chunk);
            }
        }
        println!("sha1 {}", hex::encode(hasher.finalize()));
    }

    println!(
        "{}",
        json!({
            "pool": service.pool_stats().await?,
            "extraction": service.extraction_metrics(),
        })
    );

    service.shutdown().await;

    if progress.failed > 0 {
        bail!("{} chunks could not be downloaded", progress.failed);
    }
    Ok(())
}

/// Settled chunk counts of a running stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamProgress {
    total: u32,
    ready: u32,
    failed: u32,
}

impl StreamProgress {
    fn new(total: u32) -> Self {
        Self {
            total,
            ready: 0,
            failed: 0,
        }
    }

    fn is_settled(&self) -> bool {
        self.ready + self.failed >= self.total
    }

    /// Folds in counts from the service; events may have been missed, so
    /// counters only move forward.
    fn observe(&mut self, available: u32, failed: u32) {
        self.ready = self.ready.max(available);
        self.failed = self.failed.max(failed);
    }
}

/// Catches `progress` up with the service's own bookkeeping.
async fn resync_progress(
    service: &ChunkService,
    item: &ItemId,
    progress: &mut StreamProgress,
) -> anyhow::Result<()> {
    let Some(stats) = service.get_streaming_stats(item).await? else {
        return Ok(());
    };
    let pool = service.pool_stats().await?;

    tracing::info!(
        "{}% ({}/{}), {} queued",
        stats.completed_percentage,
        stats.available_chunks,
        stats.total_chunks,
        stats.queue_length
    );

    // This process runs a single stream, so every failed pool task is one of ours
    let failed = u32::try_from(pool.failed_tasks + pool.timed_out_tasks).unwrap_or(u32::MAX);
    progress.observe(stats.available_chunks, failed);
    Ok(())
}

/// Extract chunks one by one and print their digests
///
/// # Errors
/// - Unknown title or source acquisition failure
pub async fn extract_chunks(
    title: String,
    indices: Vec<u32>,
    sim: SimulationArgs,
) -> anyhow::Result<()> {
    let (service, item) = build_service(&title, &sim, None)?;

    let info = service.get_item_info(&item).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    for index in indices {
        match service.extract_chunk(&item, index).await {
            Ok(chunk) => println!(
                "{}",
                json!({
                    "index": index,
                    "bytes": chunk.len(),
                    "sha1": hex::encode(Sha1::digest(&chunk)),
                })
            ),
            Err(e) => {
                println!("{}", json!({ "index": index, "error": e.user_message() }));
                tracing::debug!("Chunk {} failed: {}", index, e);
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&service.extraction_metrics())?);
    service.shutdown().await;
    Ok(())
}

/// Register a deterministic claim pattern and dump the registry
///
/// # Errors
/// - Unknown title
pub async fn show_claims(title: String, peers: usize, chunks: u32) -> anyhow::Result<()> {
    let sim = SimulationArgs {
        seed: 0,
        chunk_size: None,
        fault_rate: 0.0,
        latency_ms: 0,
    };
    let (service, item) = build_service(&title, &sim, None)?;

    let peers: Vec<ClaimantId> = (0..peers)
        .map(|i| ClaimantId::new(format!("peer-{i}")))
        .collect();
    for (i, peer) in peers.iter().enumerate() {
        // Each peer holds every chunk congruent to its position
        for index in (0..chunks).filter(|index| *index as usize % peers.len() == i) {
            service.register_claim(&item, index, peer);
        }
    }

    for index in 0..chunks {
        let holders: Vec<String> = service
            .get_claimants(&item, index)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("{item}#{index}: {}", holders.join(", "));
    }
    println!("{}", serde_json::to_string_pretty(&service.registry_stats())?);

    if let Some(peer) = peers.first() {
        let removed = service.remove_claimant(peer);
        println!("Removed {peer} ({removed} claims)");
        println!("{}", serde_json::to_string_pretty(&service.registry_stats())?);
    }

    service.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_settles_on_ready_plus_failed() {
        let mut progress = StreamProgress::new(10);
        progress.ready = 9;
        assert!(!progress.is_settled());

        progress.failed = 1;
        assert!(progress.is_settled());
    }

    #[test]
    fn test_observe_recovers_missed_failure_events() {
        let mut progress = StreamProgress::new(10);
        progress.ready = 7;

        // Failure event was lost to a lagged receiver
        progress.observe(9, 1);
        assert_eq!(progress.ready, 9);
        assert_eq!(progress.failed, 1);
        assert!(progress.is_settled());

        // Stale snapshots never move counters backwards
        progress.observe(3, 0);
        assert_eq!(progress, StreamProgress { total: 10, ready: 9, failed: 1 });
    }
}
