//! Sink: bridges DHT observations to metadata fetches and persistence
//!
//! The sink is the single owner of the crawl's working state. It dedupes
//! the lossy observation stream against three things: fetches already in
//! flight, infohashes that recently failed and are cooling down, and the
//! database itself. Admitted infohashes get a fetch worker; everything the
//! worker produces flows back through the sink, which is the only writer
//! to persistence.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dht::{Observation, ObservationQueue};
use crate::metainfo::{InfoHash, TorrentInfo};
use crate::peer::{fetch_metadata, FetchError, LeechConfig};
use crate::persistence::Database;

#[cfg(test)]
mod tests;

/// Tunables for admission control.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Concurrent fetches; observations beyond this are discarded.
    pub max_in_flight: usize,
    /// How long a failed infohash is ignored before it may be retried.
    pub failure_cooldown: Duration,
    /// Buffered candidate peers per in-flight fetch.
    pub peer_feed_capacity: usize,
    /// Admission pause after a persistence error.
    pub persistence_backoff: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1000,
            failure_cooldown: Duration::from_secs(60 * 60),
            peer_feed_capacity: 64,
            persistence_backoff: Duration::from_secs(1),
        }
    }
}

/// Observation consumer and fetch dispatcher.
pub struct Sink {
    db: Arc<dyn Database>,
    leech_config: Arc<LeechConfig>,
    config: SinkConfig,
}

impl Sink {
    pub fn new(db: Arc<dyn Database>, leech_config: LeechConfig, config: SinkConfig) -> Self {
        Self {
            db,
            leech_config: Arc::new(leech_config),
            config,
        }
    }

    /// Consumes observations until the task is dropped. Dropping the task
    /// aborts all in-flight fetch workers with it.
    pub async fn run(self, observations: Arc<ObservationQueue>) {
        let mut in_flight: HashMap<InfoHash, mpsc::Sender<SocketAddr>> = HashMap::new();
        let mut recently_failed: HashMap<InfoHash, Instant> = HashMap::new();
        let mut fetches: JoinSet<(InfoHash, Result<TorrentInfo, FetchError>)> = JoinSet::new();
        let mut stored: u64 = 0;
        let mut failed: u64 = 0;

        loop {
            tokio::select! {
                observation = observations.pop() => {
                    self.admit(observation, &mut in_flight, &mut recently_failed, &mut fetches)
                        .await;
                }
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => {
                    let Ok((info_hash, result)) = joined else {
                        // Worker aborted; its in-flight entry died with it.
                        continue;
                    };
                    in_flight.remove(&info_hash);

                    match result {
                        Ok(torrent) => {
                            if self.store(info_hash, torrent).await {
                                stored += 1;
                            } else {
                                recently_failed.insert(info_hash, Instant::now());
                            }
                        }
                        Err(reason) => {
                            debug!(%info_hash, %reason, "fetch failed");
                            failed += 1;
                            recently_failed.insert(info_hash, Instant::now());
                        }
                    }

                    if (stored + failed) % 256 == 0 {
                        info!(
                            stored,
                            failed,
                            in_flight = in_flight.len(),
                            cooling_down = recently_failed.len(),
                            "sink progress",
                        );
                    }
                    prune_cooldowns(&mut recently_failed, self.config.failure_cooldown);
                }
            }
        }
    }

    /// Decides what to do with one observation.
    async fn admit(
        &self,
        observation: Observation,
        in_flight: &mut HashMap<InfoHash, mpsc::Sender<SocketAddr>>,
        recently_failed: &mut HashMap<InfoHash, Instant>,
        fetches: &mut JoinSet<(InfoHash, Result<TorrentInfo, FetchError>)>,
    ) {
        let info_hash = observation.info_hash;

        // Already being fetched: hand the worker another candidate peer.
        if let Some(feed) = in_flight.get(&info_hash) {
            let _ = feed.try_send(observation.peer);
            return;
        }

        // Cooling down after a failed round.
        if let Some(failed_at) = recently_failed.get(&info_hash) {
            if failed_at.elapsed() < self.config.failure_cooldown {
                return;
            }
            recently_failed.remove(&info_hash);
        }

        if in_flight.len() >= self.config.max_in_flight {
            return;
        }

        // Already stored?
        let db = Arc::clone(&self.db);
        let known = tokio::task::spawn_blocking(move || db.exists(&info_hash)).await;
        match known {
            Ok(Ok(true)) => return,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                error!(error = %e, "persistence exists check failed; pausing admissions");
                tokio::time::sleep(self.config.persistence_backoff).await;
                return;
            }
            Err(_) => return,
        }

        let (feed_tx, feed_rx) = mpsc::channel(self.config.peer_feed_capacity);
        let _ = feed_tx.try_send(observation.peer);
        in_flight.insert(info_hash, feed_tx);

        let leech_config = Arc::clone(&self.leech_config);
        fetches.spawn(async move {
            let result = fetch_metadata(info_hash, feed_rx, leech_config).await;
            (info_hash, result)
        });
    }

    /// Writes one decoded torrent. Returns whether the write succeeded.
    async fn store(&self, info_hash: InfoHash, torrent: TorrentInfo) -> bool {
        let db = Arc::clone(&self.db);
        let name = torrent.name.clone();
        let written = tokio::task::spawn_blocking(move || {
            db.add_new_torrent(&info_hash, &torrent.name, &torrent.files)
        })
        .await;

        match written {
            Ok(Ok(())) => {
                info!(%info_hash, name = %name, "torrent stored");
                true
            }
            Ok(Err(e)) => {
                error!(%info_hash, error = %e, "persistence write failed; pausing admissions");
                tokio::time::sleep(self.config.persistence_backoff).await;
                false
            }
            Err(e) => {
                warn!(%info_hash, error = %e, "persistence task aborted");
                false
            }
        }
    }
}

fn prune_cooldowns(recently_failed: &mut HashMap<InfoHash, Instant>, cooldown: Duration) {
    if recently_failed.len() > 65536 {
        recently_failed.retain(|_, failed_at| failed_at.elapsed() < cooldown);
    }
}
