//! Advisory registry of which claimants hold which chunks.
//!
//! Claimants are external participants (browser peers) asserting possession
//! of chunks. Nothing in the core trusts these claims for correctness; they
//! are bookkeeping handed back to clients that want to source chunks from
//! each other. Every interaction refreshes the claimant's liveness so the
//! janitor can evict participants that went silent.

pub mod janitor;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

pub use janitor::{Janitor, JanitorHandle};

use crate::item::{ChunkKey, ItemId};

/// Opaque identifier of an external claimant (usually a socket/session id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClaimantId(String);

impl ClaimantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClaimantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Point-in-time counters for the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Claimants with at least one recorded interaction
    pub claimants: usize,
    /// (item, chunk) entries with a non-empty claimant set
    pub claimed_chunks: usize,
    /// Sum of claimant-set sizes across all entries
    pub total_claims: usize,
}

#[derive(Debug)]
struct ClaimantRecord {
    last_seen: Instant,
    claims: HashSet<ChunkKey>,
}

#[derive(Debug, Default)]
struct RegistryState {
    claims: HashMap<ChunkKey, HashSet<ClaimantId>>,
    claimants: HashMap<ClaimantId, ClaimantRecord>,
}

impl RegistryState {
    fn touch(&mut self, claimant: &ClaimantId, now: Instant) -> &mut ClaimantRecord {
        let record = self
            .claimants
            .entry(claimant.clone())
            .or_insert_with(|| ClaimantRecord {
                last_seen: now,
                claims: HashSet::new(),
            });
        record.last_seen = now;
        record
    }

    fn remove(&mut self, claimant: &ClaimantId) -> usize {
        let Some(record) = self.claimants.remove(claimant) else {
            return 0;
        };

        let released = record.claims.len();
        for key in record.claims {
            if let Some(holders) = self.claims.get_mut(&key) {
                holders.remove(claimant);
                if holders.is_empty() {
                    self.claims.remove(&key);
                }
            }
        }
        released
    }
}

/// In-memory claim registry guarded by a single mutex.
///
/// All operations are synchronous and never await while holding the lock.
#[derive(Debug, Default)]
pub struct ClaimRegistry {
    state: Mutex<RegistryState>,
}

impl ClaimRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `claimant` holds chunk `index` of `item`.
    ///
    /// Idempotent; unknown items need no prior registration.
    pub fn register_claim(&self, item: &ItemId, index: u32, claimant: &ClaimantId) {
        self.register_claim_at(item, index, claimant, Instant::now());
    }

    fn register_claim_at(&self, item: &ItemId, index: u32, claimant: &ClaimantId, now: Instant) {
        let key = ChunkKey::new(item.clone(), index);
        let mut state = self.state.lock();

        let newly_claimed = state.touch(claimant, now).claims.insert(key.clone());
        state.claims.entry(key).or_default().insert(claimant.clone());

        if newly_claimed {
            tracing::trace!("Claimant {} registered chunk {} of {}", claimant, index, item);
        }
    }

    /// Refreshes a claimant's liveness without changing its claims.
    pub fn touch(&self, claimant: &ClaimantId) {
        self.state.lock().touch(claimant, Instant::now());
    }

    /// Returns the claimants of a chunk, sorted; empty when nobody claims it.
    pub fn get_claimants(&self, item: &ItemId, index: u32) -> Vec<ClaimantId> {
        let key = ChunkKey::new(item.clone(), index);
        let state = self.state.lock();

        let mut holders: Vec<ClaimantId> = state
            .claims
            .get(&key)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default();
        holders.sort();
        holders
    }

    /// Returns the indices of every claimed chunk of an item, ascending.
    pub fn claimed_chunks(&self, item: &ItemId) -> Vec<u32> {
        let state = self.state.lock();
        let mut indices: Vec<u32> = state
            .claims
            .keys()
            .filter(|key| &key.item == item)
            .map(|key| key.index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Removes the claimant from every claim set and forgets its liveness.
    ///
    /// Returns how many claims were released. Safe on unknown claimants.
    pub fn remove_claimant(&self, claimant: &ClaimantId) -> usize {
        let released = self.state.lock().remove(claimant);
        if released > 0 {
            tracing::debug!("Removed claimant {} ({} claims released)", claimant, released);
        }
        released
    }

    /// Evicts every claimant whose last interaction is older than `threshold`.
    ///
    /// Returns the evicted claimants in sorted order.
    pub fn evict_stale(&self, threshold: Duration) -> Vec<ClaimantId> {
        self.evict_stale_at(threshold, Instant::now())
    }

    fn evict_stale_at(&self, threshold: Duration, now: Instant) -> Vec<ClaimantId> {
        let mut state = self.state.lock();

        let mut stale: Vec<ClaimantId> = state
            .claimants
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > threshold)
            .map(|(claimant, _)| claimant.clone())
            .collect();
        stale.sort();

        for claimant in &stale {
            state.remove(claimant);
        }
        stale
    }

    /// Time since the claimant last interacted with the registry.
    pub fn idle_time(&self, claimant: &ClaimantId) -> Option<Duration> {
        self.state
            .lock()
            .claimants
            .get(claimant)
            .map(|record| record.last_seen.elapsed())
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            claimants: state.claimants.len(),
            claimed_chunks: state.claims.len(),
            total_claims: state.claims.values().map(HashSet::len).sum(),
        }
    }
}
