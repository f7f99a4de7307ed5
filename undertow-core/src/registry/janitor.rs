//! Periodic eviction of claimants that stopped talking to us.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ClaimRegistry, ClaimantId};
use crate::config::RegistryConfig;

/// Background sweeper over a [`ClaimRegistry`].
pub struct Janitor {
    registry: Arc<ClaimRegistry>,
    stale_threshold: Duration,
    sweep_interval: Duration,
}

/// Owner handle for a running janitor; dropping it does not stop the loop,
/// call [`JanitorHandle::shutdown`].
pub struct JanitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Janitor {
    pub fn new(registry: Arc<ClaimRegistry>, config: &RegistryConfig) -> Self {
        Self {
            registry,
            stale_threshold: config.stale_threshold,
            sweep_interval: config.sweep_interval,
        }
    }

    /// Runs one eviction pass and returns the evicted claimants.
    pub fn sweep(&self) -> Vec<ClaimantId> {
        let evicted = self.registry.evict_stale(self.stale_threshold);
        if !evicted.is_empty() {
            tracing::info!(
                "Janitor evicted {} stale claimant(s) idle for more than {:?}",
                evicted.len(),
                self.stale_threshold
            );
        }
        evicted
    }

    /// Spawns the sweep loop on the current runtime.
    ///
    /// The first sweep happens one full interval after spawning.
    pub fn spawn(self) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.sweep_interval,
                self.sweep_interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::debug!(
                "Janitor started: sweep every {:?}, threshold {:?}",
                self.sweep_interval,
                self.stale_threshold
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Janitor stopped");
        });

        JanitorHandle { shutdown_tx, task }
    }
}

impl JanitorHandle {
    /// Stops the sweep loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Janitor task ended abnormally: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemId;

    fn config() -> RegistryConfig {
        RegistryConfig {
            stale_threshold: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_stale_claimants() {
        let registry = Arc::new(ClaimRegistry::new());
        let janitor = Janitor::new(registry.clone(), &config());
        let item = ItemId::from("A");

        registry.register_claim(&item, 0, &ClaimantId::from("quiet"));
        tokio::time::advance(Duration::from_secs(200)).await;
        registry.register_claim(&item, 0, &ClaimantId::from("chatty"));
        tokio::time::advance(Duration::from_secs(150)).await;

        let evicted = janitor.sweep();

        assert_eq!(evicted, vec![ClaimantId::from("quiet")]);
        assert_eq!(registry.get_claimants(&item, 0), vec![ClaimantId::from("chatty")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_evicts_and_shuts_down() {
        let registry = Arc::new(ClaimRegistry::new());
        let item = ItemId::from("A");
        registry.register_claim(&item, 4, &ClaimantId::from("gone"));

        let handle = Janitor::new(registry.clone(), &config()).spawn();
        assert!(handle.is_running());

        // First sweep at 60s finds nothing stale; the one at 360s does.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.stats().claimants, 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(registry.stats().claimants, 0);
        assert!(registry.get_claimants(&item, 4).is_empty());

        handle.shutdown().await;
    }
}
