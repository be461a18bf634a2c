//! Match Pool (spec section 4.4): one pool runs per tier, periodically
//! draining `groupSize` players off that tier's queue and handing the
//! resulting group to the Dispatcher. Driven by a `tokio::time::interval`
//! the same way the teacher's watchdog task sweeps dead rooms, generalized
//! with a wake channel (drain on demand, e.g. right after a `JoinQueue`
//! that might have completed a group) and a `CancellationToken` for clean
//! shutdown instead of the teacher's bare infinite loop.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use protocol::{MatchResult, Tier};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MatchmakerConfig;
use crate::error::{MatchmakerError, Result};
use crate::node_registry::NodeRegistry;
use crate::queue_store::{QueueEntry, QueueStore};
use crate::router_store::RouterStore;

/// Pool lifecycle (spec 4.4): `Created` pools have never ticked;
/// `Stopping`/`Stopped` distinguish "cancellation requested" from "driver
/// task has actually exited" so callers can `await` a clean stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for PoolState {
    fn from(v: u8) -> Self {
        match v {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

/// Drains one tier's queue on a timer and forwards completed groups to a
/// Dispatcher over `results`. Holds no players of its own between ticks —
/// everything in flight lives in the queue store until the moment it is
/// popped, so a crash between ticks loses nothing.
pub struct MatchPool {
    pub tier: Tier,
    queue_store: Arc<dyn QueueStore>,
    router_store: Arc<dyn RouterStore>,
    registry: Arc<NodeRegistry>,
    config: Arc<MatchmakerConfig>,
    results: mpsc::Sender<MatchResult>,
    state: AtomicU8,
    wake: mpsc::Sender<()>,
    wake_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
    drain_rate: Mutex<DrainRate>,
}

/// Exponential moving average of players drained per second, used to turn a
/// `QueryStatus` position into an ETA (spec section 9, Open Question 2).
struct DrainRate {
    players_per_sec: f64,
    last_drain: Option<Instant>,
}

const DRAIN_RATE_ALPHA: f64 = 0.3;
const MIN_DRAIN_RATE: f64 = 0.001;

impl MatchPool {
    pub fn new(
        tier: Tier,
        queue_store: Arc<dyn QueueStore>,
        router_store: Arc<dyn RouterStore>,
        registry: Arc<NodeRegistry>,
        config: Arc<MatchmakerConfig>,
        results: mpsc::Sender<MatchResult>,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(8);
        MatchPool {
            tier,
            queue_store,
            router_store,
            registry,
            config,
            results,
            state: AtomicU8::new(PoolState::Created as u8),
            wake: wake_tx,
            wake_rx: tokio::sync::Mutex::new(Some(wake_rx)),
            cancel: CancellationToken::new(),
            drain_rate: Mutex::new(DrainRate { players_per_sec: 0.0, last_drain: None }),
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::SeqCst))
    }

    /// Current smoothed players-drained-per-second for this tier.
    pub fn drain_rate_per_sec(&self) -> f64 {
        self.drain_rate.lock().unwrap().players_per_sec.max(MIN_DRAIN_RATE)
    }

    /// Estimated seconds until a player at `position` in this tier's queue
    /// gets drained, or `None` if nothing has drained yet to base a rate on.
    pub fn eta_seconds(&self, position: u64) -> Option<f64> {
        let state = self.drain_rate.lock().unwrap();
        state.last_drain?;
        Some(position as f64 / state.players_per_sec.max(MIN_DRAIN_RATE))
    }

    fn record_drain(&self, players_drained: u32) {
        let mut state = self.drain_rate.lock().unwrap();
        let now = Instant::now();
        let instantaneous = match state.last_drain {
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64().max(0.001);
                players_drained as f64 / elapsed
            }
            None => players_drained as f64 / self.config.match_interval_secs.max(0.001),
        };
        state.players_per_sec = if state.last_drain.is_some() {
            DRAIN_RATE_ALPHA * instantaneous + (1.0 - DRAIN_RATE_ALPHA) * state.players_per_sec
        } else {
            instantaneous
        };
        state.last_drain = Some(now);
    }

    /// Nudges the driver to attempt a drain before its next timer tick.
    /// Best-effort: a full wake channel means a drain is already pending.
    pub fn nudge(&self) {
        let _ = self.wake.try_send(());
    }

    pub fn stop(&self) {
        self.state.store(PoolState::Stopping as u8, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Runs the periodic driver until `stop` is called. Consumes the wake
    /// receiver on first call; a pool can only be run once.
    pub async fn run(self: Arc<Self>) {
        let mut wake_rx = match self.wake_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        self.state.store(PoolState::Running as u8, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(self.config.match_interval());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wake_rx.recv() => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.sweep_once().await;
            for _ in 0..self.config.batch_size {
                match self.drain_once().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) if e.is_transient() => {
                        tracing::warn!(tier = %self.tier, error = %e, "transient error during drain, will retry next tick");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(tier = %self.tier, error = %e, "non-transient error during drain");
                        break;
                    }
                }
            }
        }
        self.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
    }

    async fn sweep_once(&self) {
        match self
            .queue_store
            .sweep_expired(self.tier, self.config.max_wait())
            .await
        {
            Ok(expired) if !expired.is_empty() => {
                tracing::warn!(tier = %self.tier, count = expired.len(), "swept expired queue entries");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(tier = %self.tier, error = %e, "sweep_expired failed"),
        }
    }

    /// One attempt at draining a single group. Returns `Ok(true)` if a group
    /// was dispatched, `Ok(false)` if the tier doesn't hold enough players
    /// right now (not an error — just nothing to do), and `Err` for anything
    /// that forced a rewind.
    pub async fn drain_once(&self) -> Result<bool> {
        let group_size = self.config.group_size;
        let popped = self.queue_store.pop_lowest(self.tier, group_size).await?;
        if popped.len() < group_size as usize {
            if !popped.is_empty() {
                self.rewind(popped).await;
            }
            return Ok(false);
        }

        match self.assemble(&popped).await {
            Ok(result) => {
                let group_len = popped.len() as u32;
                if self.results.send(result).await.is_err() {
                    tracing::error!(tier = %self.tier, "dispatcher channel closed, rewinding group");
                    self.rewind(popped).await;
                    return Err(MatchmakerError::Cancelled);
                }
                self.record_drain(group_len);
                Ok(true)
            }
            Err(e) => {
                self.rewind(popped).await;
                Err(e)
            }
        }
    }

    async fn assemble(&self, popped: &[QueueEntry]) -> Result<MatchResult> {
        let mut players = std::collections::HashMap::new();
        for entry in popped {
            let router_entry = self
                .router_store
                .get(&entry.player_id)
                .await
                .map_err(|_| MatchmakerError::RouterMissing(entry.player_id.clone()))?;
            players.insert(entry.player_id.clone(), router_entry.entry_topic);
        }

        let node = self.registry.select_node(self.config.selection_strategy)?;

        Ok(MatchResult {
            pool_id: format!("{}-{}", self.tier, uuid_like()),
            players,
            chosen_node_id: node.node_id,
            chosen_node_address: node.address,
            ruleset_id: self.config.ruleset_id,
        })
    }

    async fn rewind(&self, entries: Vec<QueueEntry>) {
        if let Err(e) = self.queue_store.reinsert(self.tier, entries).await {
            tracing::error!(tier = %self.tier, error = %e, "rewind failed, players dropped from queue");
        }
    }
}

/// A short, non-cryptographic, collision-resistant-enough-for-logging id.
/// `pool_id` only needs to disambiguate dispatcher log lines, not double as
/// a security token, so a random u64 in hex is sufficient without pulling
/// in a dedicated uuid dependency.
fn uuid_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    u64::from_le_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_store::MemoryQueueStore;
    use crate::router_store::MemoryRouterStore;
    use crate::node_registry::NodeInfo;
    use std::time::Instant;

    fn test_pool(group_size: u32) -> (Arc<MatchPool>, mpsc::Receiver<MatchResult>) {
        let queue_store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let router_store: Arc<dyn RouterStore> = Arc::new(MemoryRouterStore::new(Duration::from_secs(60)));
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(30)));
        registry.put(NodeInfo {
            node_id: "node-1".to_string(),
            address: "127.0.0.1:9000".to_string(),
            load: 1.0,
            version: "1".to_string(),
            weight: 1,
            last_seen: Instant::now(),
        });
        let mut config = MatchmakerConfig::default();
        config.group_size = group_size;
        let (tx, rx) = mpsc::channel(8);
        let pool = Arc::new(MatchPool::new(
            Tier::Novice,
            queue_store,
            router_store,
            registry,
            Arc::new(config),
            tx,
        ));
        (pool, rx)
    }

    #[tokio::test]
    async fn drain_with_too_few_players_does_nothing() {
        let (pool, _rx) = test_pool(4);
        pool.queue_store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        let did_drain = pool.drain_once().await.unwrap();
        assert!(!did_drain);
        assert_eq!(pool.queue_store.size(Tier::Novice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drain_with_full_group_dispatches_and_empties_queue() {
        let (pool, mut rx) = test_pool(2);
        pool.router_store.set_entry_topic("p1", "entry-1").await.unwrap();
        pool.router_store.set_entry_topic("p2", "entry-2").await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();

        let did_drain = pool.drain_once().await.unwrap();
        assert!(did_drain);
        assert_eq!(pool.queue_store.size(Tier::Novice).await.unwrap(), 0);

        let result = rx.recv().await.unwrap();
        assert_eq!(result.players.len(), 2);
        assert_eq!(result.chosen_node_id, "node-1");
    }

    #[tokio::test]
    async fn missing_router_entry_rewinds_whole_group() {
        let (pool, _rx) = test_pool(2);
        pool.router_store.set_entry_topic("p1", "entry-1").await.unwrap();
        // p2 has no router entry.
        pool.queue_store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();

        let err = pool.drain_once().await.unwrap_err();
        assert!(matches!(err, MatchmakerError::RouterMissing(_)));
        assert_eq!(pool.queue_store.size(Tier::Novice).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn no_healthy_node_rewinds_whole_group() {
        let queue_store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let router_store: Arc<dyn RouterStore> = Arc::new(MemoryRouterStore::new(Duration::from_secs(60)));
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(30))); // empty
        let mut config = MatchmakerConfig::default();
        config.group_size = 1;
        let (tx, _rx) = mpsc::channel(8);
        let pool = MatchPool::new(Tier::Novice, queue_store, router_store, registry, Arc::new(config), tx);

        pool.router_store.set_entry_topic("p1", "entry-1").await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();

        let err = pool.drain_once().await.unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
        assert_eq!(pool.queue_store.size(Tier::Novice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn eta_is_none_before_any_drain_has_happened() {
        let (pool, _rx) = test_pool(2);
        assert_eq!(pool.eta_seconds(1), None);
    }

    #[tokio::test]
    async fn eta_becomes_available_after_a_drain() {
        let (pool, _rx) = test_pool(2);
        pool.router_store.set_entry_topic("p1", "entry-1").await.unwrap();
        pool.router_store.set_entry_topic("p2", "entry-2").await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        pool.queue_store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();
        pool.drain_once().await.unwrap();
        assert!(pool.eta_seconds(1).is_some());
    }

    #[tokio::test]
    async fn stop_transitions_state_to_stopped() {
        let (pool, _rx) = test_pool(4);
        let runner = pool.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        tokio::task::yield_now().await;
        pool.stop();
        handle.await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}
