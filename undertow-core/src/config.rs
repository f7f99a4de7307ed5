//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub registry: RegistryConfig,
    pub source: SourceConfig,
    pub extraction: ExtractionConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
}

/// Claim registry and janitor configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Idle time after which a claimant is evicted
    pub stale_threshold: Duration,
    /// Period between janitor sweeps
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300), // 5 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Upstream source handle configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// How long to wait for a freshly opened source to report metadata
    pub readiness_timeout: Duration,
    /// Chunk size for items whose chunk size was never set explicitly
    pub default_chunk_size: u32,
    /// Failed reads on a not-yet-ready handle tolerated before they start
    /// consuming the regular attempt budget
    pub unready_read_grace: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(60),
            default_chunk_size: 1024 * 1024, // 1 MiB
            unready_read_grace: 0,
        }
    }
}

/// Extraction pipeline configuration.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Simultaneous extractions allowed per item
    pub max_concurrent_per_item: usize,
    /// Timeout for a single range read attempt
    pub attempt_timeout: Duration,
    /// Read attempts before giving up on a chunk
    pub max_attempts: u32,
    /// Backoff unit; the wait after attempt `n` is `n * backoff_step`
    pub backoff_step: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_item: 3,
            attempt_timeout: Duration::from_secs(15),
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

/// Worker pool and download strategy configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers in the pool
    pub worker_count: usize,
    /// Hard limit on a single task assigned to a worker
    pub task_timeout: Duration,
    /// Delay before a crashed worker is replaced
    pub respawn_delay: Duration,
    /// Leading chunks issued as priority when a stream starts
    pub priority_chunks: u32,
    /// Pause between priority chunk submissions
    pub priority_stagger: Duration,
    /// Pause between background chunk submissions
    pub background_stagger: Duration,
    /// Capacity of each stream's event channel
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            task_timeout: Duration::from_secs(30),
            respawn_delay: Duration::from_secs(1),
            priority_chunks: 5,
            priority_stagger: Duration::from_millis(50),
            background_stagger: Duration::from_millis(200),
            event_capacity: 256,
        }
    }
}

/// Half the physical cores, never fewer than two workers.
pub fn default_worker_count() -> usize {
    (num_cpus::get_physical() / 2).max(2)
}

/// Extracted chunk persistence configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Chunks kept by the in-memory store before LRU eviction
    pub memory_capacity: usize,
    /// Directory for the file-backed store (None = in-memory only)
    pub chunk_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 512,
            chunk_dir: None,
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>("UNDERTOW_WORKERS") {
            config.scheduler.worker_count = workers.max(1);
        }

        if let Some(cap) = env_parse::<usize>("UNDERTOW_MAX_PER_ITEM") {
            config.extraction.max_concurrent_per_item = cap.max(1);
        }

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_STALE_THRESHOLD") {
            config.registry.stale_threshold = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("UNDERTOW_READINESS_TIMEOUT") {
            config.source.readiness_timeout = Duration::from_secs(seconds);
        }

        if let Ok(dir) = std::env::var("UNDERTOW_CHUNK_DIR") {
            if !dir.is_empty() {
                config.storage.chunk_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }

    /// Creates a configuration with short timeouts suited to tests.
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig {
                stale_threshold: Duration::from_secs(5),
                sweep_interval: Duration::from_secs(1),
            },
            source: SourceConfig {
                readiness_timeout: Duration::from_secs(2),
                default_chunk_size: 1024,
                unready_read_grace: 0,
            },
            extraction: ExtractionConfig {
                attempt_timeout: Duration::from_secs(1),
                backoff_step: Duration::from_millis(10),
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                worker_count: 2,
                task_timeout: Duration::from_secs(5),
                respawn_delay: Duration::from_millis(50),
                priority_stagger: Duration::from_millis(1),
                background_stagger: Duration::from_millis(2),
                ..Default::default()
            },
            storage: StorageConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
