//! Periodic eviction of silent stations.
//!
//! A station stays live while it contacts the aggregator (PUT or HEARTBEAT)
//! at least once per inactivity threshold. Sweeps are periodic, so eviction
//! can lag the threshold by up to one sweep period. With the default
//! settings the threshold equals the period, so a station that last
//! contacted right at the window edge may go on the next sweep.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::select;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::server::ServerContext;
use crate::store::StoreError;

pub struct EvictionSweeper {
    context: Arc<ServerContext>,
    period: Duration,
    threshold: Duration,
}

impl EvictionSweeper {
    pub fn new(context: Arc<ServerContext>, period: Duration, threshold: Duration) -> Self {
        Self {
            context,
            period,
            threshold,
        }
    }

    /// Sweeps every period until `running` flips to false or its sender drops.
    pub async fn run(self, mut running: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticker.tick() => {}
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if !*running.borrow() {
                break;
            }
            if let Err(err) = self.sweep_once(SystemTime::now()).await {
                warn!(error = %err, "eviction sweep failed");
            }
        }
        debug!("eviction sweeper stopped");
    }

    /// Evicts every station whose last contact is older than
    /// `now - threshold`, or that has a record but no registry entry.
    ///
    /// Returns the evicted ids in sorted order.
    pub async fn sweep_once(&self, now: SystemTime) -> Result<Vec<String>, StoreError> {
        let cutoff = now.checked_sub(self.threshold).unwrap_or(SystemTime::UNIX_EPOCH);
        let registry = &self.context.registry;
        let store = &self.context.store;

        let mut candidates: BTreeSet<String> = store.ids().await?.into_iter().collect();
        candidates.extend(registry.ids());

        let mut evicted = Vec::new();
        for station in candidates {
            let removed = store
                .remove_if(&station, || registry.remove_if_stale(&station, cutoff))
                .await;

            match removed {
                Ok(true) => {
                    info!(%station, "evicted inactive station");
                    evicted.push(station);
                }
                Ok(false) => {}
                Err(StoreError::InvalidKey(_)) => {
                    // Heartbeat-only ids may not be valid record keys.
                    if registry.remove_if_stale(&station, cutoff) {
                        info!(%station, "evicted inactive station");
                        evicted.push(station);
                    }
                }
                Err(err) => warn!(%station, error = %err, "failed to evict station record"),
            }
        }

        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PutOutcome, RecordStore};

    const THRESHOLD: Duration = Duration::from_secs(30);

    async fn sweeper_in(dir: &tempfile::TempDir) -> EvictionSweeper {
        let store = RecordStore::open(dir.path()).await.expect("open store");
        EvictionSweeper::new(
            Arc::new(ServerContext::new(store)),
            Duration::from_secs(30),
            THRESHOLD,
        )
    }

    #[tokio::test]
    async fn evicts_stale_and_keeps_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sweeper = sweeper_in(&dir).await;
        let context = Arc::clone(&sweeper.context);
        let now = SystemTime::now();

        context.store.put("OLD", "{}").await.expect("put old");
        context.store.put("NEW", "{}").await.expect("put new");
        context.registry.touch_at("OLD", now - Duration::from_secs(31));
        context.registry.touch_at("NEW", now - Duration::from_secs(5));

        let evicted = sweeper.sweep_once(now).await.expect("sweep");

        assert_eq!(evicted, vec!["OLD".to_string()]);
        assert!(!context.store.contains("OLD").await.expect("contains"));
        assert_eq!(context.registry.last_contact("OLD"), None);
        assert!(context.store.contains("NEW").await.expect("contains"));
        assert!(context.registry.last_contact("NEW").is_some());
    }

    #[tokio::test]
    async fn record_without_registry_entry_is_evicted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sweeper = sweeper_in(&dir).await;
        sweeper.context.store.put("ORPHAN", "{}").await.expect("put");

        let evicted = sweeper.sweep_once(SystemTime::now()).await.expect("sweep");

        assert_eq!(evicted, vec!["ORPHAN".to_string()]);
    }

    #[tokio::test]
    async fn heartbeat_only_station_leaves_registry_when_silent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sweeper = sweeper_in(&dir).await;
        let now = SystemTime::now();
        sweeper
            .context
            .registry
            .touch_at("HB", now - Duration::from_secs(60));

        let evicted = sweeper.sweep_once(now).await.expect("sweep");

        assert_eq!(evicted, vec!["HB".to_string()]);
        assert!(sweeper.context.registry.is_empty());
    }

    #[tokio::test]
    async fn put_racing_a_sweep_keeps_its_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sweeper = sweeper_in(&dir).await;
        let context = Arc::clone(&sweeper.context);
        let now = SystemTime::now();
        context.store.put("S1", "{\"id\":\"S1\"}").await.expect("seed");
        context.registry.touch_at("S1", now - Duration::from_secs(60));

        // The PUT takes the stripe lock first; the sweep must then see its
        // refreshed contact rather than the stale one.
        let registry = &context.registry;
        let (stored, evicted) = tokio::join!(
            context
                .store
                .put_with("S1", "{\"id\":\"S1\",\"v\":2}", || registry.touch_at("S1", now)),
            sweeper.sweep_once(now),
        );

        assert_eq!(stored.expect("put"), PutOutcome::Replaced);
        assert!(evicted.expect("sweep").is_empty());
        assert_eq!(registry.last_contact("S1"), Some(now));
        assert_eq!(
            context.store.get("S1").await.expect("get").as_deref(),
            Some("{\"id\":\"S1\",\"v\":2}")
        );
    }

    #[tokio::test]
    async fn run_exits_when_running_flag_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sweeper = sweeper_in(&dir).await;
        let (running_tx, running_rx) = watch::channel(true);

        let task = tokio::spawn(sweeper.run(running_rx));
        running_tx.send(false).expect("send stop");

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper should stop promptly")
            .expect("sweeper task");
    }
}
