//! Deterministic in-process source for development and demos.
//!
//! Titles serve reproducible pattern bytes. Readiness delay, read latency and
//! transient faults are drawn from a seeded ChaCha8 generator so a run can be
//! replayed with the same seed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::time::Instant;

use super::{MediaSource, SourceDescriptor, SourceError, SourceFile, SourceMetadata, SourceSession};
use crate::item::ItemId;

const LOCATOR_SCHEME: &str = "sim://";

/// A title known to the simulated source.
#[derive(Debug, Clone)]
pub struct SimulatedTitle {
    pub name: String,
    pub files: Vec<SourceFile>,
}

impl SimulatedTitle {
    pub fn new(name: impl Into<String>, files: Vec<SourceFile>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }

    /// Locator under which the simulated source resolves this title.
    pub fn locator(&self) -> String {
        format!("{LOCATOR_SCHEME}{}", self.name)
    }
}

/// Simulated upstream with seeded latency and fault injection.
pub struct SimulatedSource {
    titles: HashMap<String, SimulatedTitle>,
    ready_delay: Duration,
    read_latency: (Duration, Duration),
    fault_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    seed: u64,
}

impl SimulatedSource {
    pub fn new(seed: u64) -> Self {
        Self {
            titles: HashMap::new(),
            ready_delay: Duration::ZERO,
            read_latency: (Duration::ZERO, Duration::ZERO),
            fault_rate: 0.0,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            seed,
        }
    }

    /// Three open-movie titles with a sample and a subtitle each.
    pub fn demo(seed: u64) -> Self {
        const MIB: u64 = 1024 * 1024;

        [
            ("Big Buck Bunny", "big_buck_bunny_1080p.mp4", 158 * MIB),
            ("Sintel", "Sintel.2010.1080p.mkv", 129 * MIB),
            ("Tears of Steel", "tears_of_steel_720p.mov", 72 * MIB),
        ]
        .into_iter()
        .fold(Self::new(seed), |source, (name, file, length)| {
            source.with_title(SimulatedTitle::new(
                name,
                vec![
                    SourceFile::new(format!("{name}/Sample/sample.mp4"), 4 * MIB),
                    SourceFile::new(format!("{name}/{file}"), length),
                    SourceFile::new(format!("{name}/subs.en.srt"), 80 * 1024),
                ],
            ))
        })
    }

    pub fn with_title(mut self, title: SimulatedTitle) -> Self {
        self.titles.insert(title.name.clone(), title);
        self
    }

    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_read_latency(mut self, min: Duration, max: Duration) -> Self {
        self.read_latency = (min, max.max(min));
        self
    }

    /// Probability in `[0, 1]` that a range read fails transiently.
    pub fn with_fault_rate(mut self, rate: f64) -> Self {
        self.fault_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn titles(&self) -> impl Iterator<Item = &SimulatedTitle> {
        self.titles.values()
    }

    pub fn title(&self, name: &str) -> Option<&SimulatedTitle> {
        self.titles.get(name)
    }

    fn resolve(&self, item: &ItemId, descriptor: &SourceDescriptor) -> Option<&SimulatedTitle> {
        match descriptor {
            SourceDescriptor::Locator(locator) => locator
                .strip_prefix(LOCATOR_SCHEME)
                .and_then(|name| self.titles.get(name)),
            SourceDescriptor::Magnet(magnet) => magnet
                .display_name
                .as_deref()
                .and_then(|name| self.titles.get(name)),
        }
        .or_else(|| self.titles.get(item.as_str()))
    }
}

#[async_trait]
impl MediaSource for SimulatedSource {
    async fn open(
        &self,
        item: &ItemId,
        descriptor: &SourceDescriptor,
    ) -> Result<Arc<dyn SourceSession>, SourceError> {
        let title = self
            .resolve(item, descriptor)
            .ok_or_else(|| SourceError::ConnectionFailed {
                item: item.clone(),
                reason: format!("no simulated title for {descriptor}"),
            })?;

        tracing::debug!("Simulated source opened {} ({} files)", title.name, title.files.len());

        Ok(Arc::new(SimulatedSession {
            files: title.files.clone(),
            salt: title.name.bytes().fold(0u64, |acc, b| acc.wrapping_add(u64::from(b))),
            ready_at: Instant::now() + self.ready_delay,
            read_latency: self.read_latency,
            fault_rate: self.fault_rate,
            rng: Arc::clone(&self.rng),
        }))
    }
}

struct SimulatedSession {
    files: Vec<SourceFile>,
    salt: u64,
    ready_at: Instant,
    read_latency: (Duration, Duration),
    fault_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimulatedSession {
    fn roll(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock();
        let (min, max) = self.read_latency;
        let latency_ms = rng.random_range(min.as_millis()..=max.as_millis());
        let latency = Duration::from_millis(u64::try_from(latency_ms).unwrap_or(u64::MAX));
        (latency, rng.random_bool(self.fault_rate))
    }
}

#[async_trait]
impl SourceSession for SimulatedSession {
    async fn wait_ready(&self) -> Result<SourceMetadata, SourceError> {
        tokio::time::sleep_until(self.ready_at).await;
        Ok(SourceMetadata {
            files: self.files.clone(),
        })
    }

    fn metadata(&self) -> Option<SourceMetadata> {
        (Instant::now() >= self.ready_at).then(|| SourceMetadata {
            files: self.files.clone(),
        })
    }

    async fn read_range(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SourceError> {
        let (latency, fault) = self.roll();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if fault {
            return Err(SourceError::ReadFailed {
                reason: "simulated peer disconnect".to_string(),
            });
        }

        let file = self.files.get(file_index).ok_or_else(|| SourceError::ReadFailed {
            reason: format!("no file at index {file_index}"),
        })?;
        if offset >= file.length {
            return Ok(Bytes::new());
        }

        let available = usize::try_from(file.length - offset).unwrap_or(usize::MAX);
        let data: Vec<u8> = (0..length.min(available) as u64)
            .map(|i| ((offset + i + self.salt) % 251) as u8)
            .collect();
        Ok(data.into())
    }
}
