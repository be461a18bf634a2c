//! Queue Store (spec section 4.1): a per-tier ordered multiset with O(log n)
//! insert/remove/peek and atomic "pop N lowest", plus the inverse index
//! player -> tier that makes `join_queue` idempotent and `leave_queue` O(1).
//!
//! The pair (tier set, inverse index) must appear atomic to every reader and
//! writer, including other matchmaker processes racing against the same
//! backing store (I1-I3). The Redis implementation gets this from
//! server-evaluated Lua scripts, the same pattern the retrieval pack's
//! `mm-worker` uses for its Redis-backed matchmaking state — a client-side
//! lock is not sufficient since several matchmaker processes run
//! concurrently against the same store.

use crate::error::{MatchmakerError, Result};
use async_trait::async_trait;
use protocol::Tier;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `(playerID, tier, score, enqueuedAt)`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub player_id: String,
    pub tier: Tier,
    pub score: f64,
    pub enqueued_at: f64,
}

/// Current wall-clock time as epoch seconds. A free function (not a trait
/// object) because the stores need it for cutoff computation but nothing
/// here needs a controllable clock — only the Match Pool's driver loop does.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Combines a caller-given priority with a tie-breaking fractional part so
/// that equal-priority entries drain in insertion order (spec: "equal scores
/// break by insertion order"). `enqueued_at` grows without bound in whole
/// seconds but we only need its ordering within one priority bucket, so a
/// sub-second fraction keyed off an ever-increasing timestamp is enough.
fn compose_score(score: f64, enqueued_at: f64) -> f64 {
    let tie_break = (enqueued_at % 1_000_000.0) / 1_000_000.0;
    score + tie_break
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Fails with `AlreadyQueued` if the player is already indexed under any tier.
    async fn join_queue(&self, tier: Tier, player_id: &str, score: f64) -> Result<()>;

    /// Fails with `NotQueued` if the player is not indexed under any tier.
    async fn leave_queue(&self, player_id: &str) -> Result<()>;

    /// Pops up to `n` lowest-score entries, atomically removing them and
    /// their inverse-index entries. Returns fewer than `n` if the tier holds
    /// fewer members.
    async fn pop_lowest(&self, tier: Tier, n: u32) -> Result<Vec<QueueEntry>>;

    /// Re-inserts a previously popped group (rewind path). Does not run the
    /// `AlreadyQueued` check — callers only ever rewind entries they just
    /// popped themselves.
    async fn reinsert(&self, tier: Tier, entries: Vec<QueueEntry>) -> Result<()>;

    /// Point-in-time cardinality of one tier.
    async fn size(&self, tier: Tier) -> Result<u64>;

    /// Removes and returns entries whose age exceeds `max_wait`.
    async fn sweep_expired(&self, tier: Tier, max_wait: Duration) -> Result<Vec<QueueEntry>>;

    /// 1-indexed rank of `player_id` within `tier`'s ordered set, or `None`
    /// if the player is not in that tier. Used for `QueryStatus` position.
    async fn position(&self, tier: Tier, player_id: &str) -> Result<Option<u64>>;
}

fn tier_zset_key(tier: Tier) -> String {
    format!("mm:queue:{}", tier.as_key())
}

fn tier_meta_key(tier: Tier) -> String {
    format!("mm:queue_meta:{}", tier.as_key())
}

const PLAYER_INDEX_KEY: &str = "mm:queue_player_index";
const QUEUE_KEY_PREFIX: &str = "mm:queue:";
const META_KEY_PREFIX: &str = "mm:queue_meta:";

/// Redis-backed implementation, the production store. Shared across every
/// matchmaker process in the cluster (spec section 5): atomicity comes from
/// the Lua scripts below, not from any lock held in this process.
pub struct RedisQueueStore {
    conn: ConnectionManager,
    join_script: Script,
    leave_script: Script,
    pop_script: Script,
    reinsert_script: Script,
    sweep_script: Script,
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisQueueStore {
            conn,
            join_script: Script::new(include_str!("lua/join_queue.lua")),
            leave_script: Script::new(include_str!("lua/leave_queue.lua")),
            pop_script: Script::new(include_str!("lua/pop_lowest.lua")),
            reinsert_script: Script::new(include_str!("lua/reinsert.lua")),
            sweep_script: Script::new(include_str!("lua/sweep_expired.lua")),
        })
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn join_queue(&self, tier: Tier, player_id: &str, score: f64) -> Result<()> {
        let now = epoch_seconds();
        let composite = compose_score(score, now);
        let mut conn = self.conn.clone();
        let (inserted, _existing): (i64, String) = self
            .join_script
            .key(tier_zset_key(tier))
            .key(tier_meta_key(tier))
            .key(PLAYER_INDEX_KEY)
            .arg(player_id)
            .arg(composite)
            .arg(tier.as_key())
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MatchmakerError::StoreAtomicityViolation("join_queue".into(), e.to_string()))?;
        if inserted == 1 {
            Ok(())
        } else {
            Err(MatchmakerError::AlreadyQueued(player_id.to_string()))
        }
    }

    async fn leave_queue(&self, player_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let tier: redis::Value = self
            .leave_script
            .key(PLAYER_INDEX_KEY)
            .arg(player_id)
            .arg(QUEUE_KEY_PREFIX)
            .arg(META_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MatchmakerError::StoreAtomicityViolation("leave_queue".into(), e.to_string()))?;
        match tier {
            redis::Value::Nil | redis::Value::Boolean(false) => {
                Err(MatchmakerError::NotQueued(player_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn pop_lowest(&self, tier: Tier, n: u32) -> Result<Vec<QueueEntry>> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .pop_script
            .key(tier_zset_key(tier))
            .key(tier_meta_key(tier))
            .key(PLAYER_INDEX_KEY)
            .arg(n)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MatchmakerError::StoreAtomicityViolation("pop_lowest".into(), e.to_string()))?;
        Ok(triples_to_entries(tier, &flat))
    }

    async fn reinsert(&self, tier: Tier, entries: Vec<QueueEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut invocation = self.reinsert_script.prepare_invoke();
        invocation
            .key(tier_zset_key(tier))
            .key(tier_meta_key(tier))
            .key(PLAYER_INDEX_KEY)
            .arg(tier.as_key());
        for entry in &entries {
            invocation.arg(&entry.player_id).arg(entry.score).arg(entry.enqueued_at);
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MatchmakerError::StoreAtomicityViolation("reinsert".into(), e.to_string()))?;
        Ok(())
    }

    async fn size(&self, tier: Tier) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(tier_zset_key(tier)).await?;
        Ok(count)
    }

    async fn sweep_expired(&self, tier: Tier, max_wait: Duration) -> Result<Vec<QueueEntry>> {
        let cutoff = epoch_seconds() - max_wait.as_secs_f64();
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .sweep_script
            .key(tier_zset_key(tier))
            .key(tier_meta_key(tier))
            .key(PLAYER_INDEX_KEY)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| MatchmakerError::StoreAtomicityViolation("sweep_expired".into(), e.to_string()))?;
        Ok(triples_to_entries(tier, &flat))
    }

    async fn position(&self, tier: Tier, player_id: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let rank: Option<u64> = conn.zrank(tier_zset_key(tier), player_id).await?;
        Ok(rank.map(|r| r + 1))
    }
}

fn triples_to_entries(tier: Tier, flat: &[String]) -> Vec<QueueEntry> {
    flat.chunks_exact(3)
        .map(|chunk| QueueEntry {
            player_id: chunk[0].clone(),
            tier,
            score: chunk[1].parse().unwrap_or(0.0),
            enqueued_at: chunk[2].parse().unwrap_or(0.0),
        })
        .collect()
}

/// In-process, in-memory store used for tests. Not cluster-safe (no other
/// process can see it) — that is the point: it gives Match Pool / Dispatcher
/// tests a deterministic double instead of a live Redis dependency.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    /// Composite score (bit-for-bit comparable via `total_cmp`) -> entry, per tier.
    tiers: HashMap<Tier, BTreeMap<OrderedScore, QueueEntry>>,
    player_index: HashMap<String, Tier>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedScore(f64);
impl Eq for OrderedScore {}
impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn join_queue(&self, tier: Tier, player_id: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.player_index.contains_key(player_id) {
            return Err(MatchmakerError::AlreadyQueued(player_id.to_string()));
        }
        let now = epoch_seconds();
        let composite = compose_score(score, now);
        let entry = QueueEntry {
            player_id: player_id.to_string(),
            tier,
            score: composite,
            enqueued_at: now,
        };
        inner
            .tiers
            .entry(tier)
            .or_default()
            .insert(OrderedScore(composite), entry);
        inner.player_index.insert(player_id.to_string(), tier);
        Ok(())
    }

    async fn leave_queue(&self, player_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(tier) = inner.player_index.remove(player_id) else {
            return Err(MatchmakerError::NotQueued(player_id.to_string()));
        };
        if let Some(set) = inner.tiers.get_mut(&tier) {
            set.retain(|_, e| e.player_id != player_id);
        }
        Ok(())
    }

    async fn pop_lowest(&self, tier: Tier, n: u32) -> Result<Vec<QueueEntry>> {
        let mut inner = self.inner.lock().unwrap();
        let mut popped = Vec::new();
        if let Some(set) = inner.tiers.get_mut(&tier) {
            let keys: Vec<OrderedScore> = set.keys().take(n as usize).copied().collect();
            for key in keys {
                if let Some(entry) = set.remove(&key) {
                    popped.push(entry);
                }
            }
        }
        for entry in &popped {
            inner.player_index.remove(&entry.player_id);
        }
        Ok(popped)
    }

    async fn reinsert(&self, tier: Tier, entries: Vec<QueueEntry>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            inner
                .tiers
                .entry(tier)
                .or_default()
                .insert(OrderedScore(entry.score), entry.clone());
            inner.player_index.insert(entry.player_id.clone(), tier);
        }
        Ok(())
    }

    async fn size(&self, tier: Tier) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tiers.get(&tier).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn sweep_expired(&self, tier: Tier, max_wait: Duration) -> Result<Vec<QueueEntry>> {
        let cutoff = epoch_seconds() - max_wait.as_secs_f64();
        let mut inner = self.inner.lock().unwrap();
        let mut swept = Vec::new();
        if let Some(set) = inner.tiers.get_mut(&tier) {
            let stale: Vec<OrderedScore> = set
                .iter()
                .filter(|(_, e)| e.enqueued_at <= cutoff)
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                if let Some(entry) = set.remove(&key) {
                    swept.push(entry);
                }
            }
        }
        for entry in &swept {
            inner.player_index.remove(&entry.player_id);
        }
        Ok(swept)
    }

    async fn position(&self, tier: Tier, player_id: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock().unwrap();
        let Some(set) = inner.tiers.get(&tier) else {
            return Ok(None);
        };
        let mut rank = 0u64;
        for entry in set.values() {
            rank += 1;
            if entry.player_id == player_id {
                return Ok(Some(rank));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_then_pop_returns_player() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        let popped = store.pop_lowest(Tier::Novice, 4).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].player_id, "p1");
        assert_eq!(store.size(Tier::Novice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn join_twice_is_already_queued() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        let second = store.join_queue(Tier::Novice, "p1", 1.0).await;
        assert!(matches!(second, Err(MatchmakerError::AlreadyQueued(_))));
    }

    #[tokio::test]
    async fn leave_without_join_is_not_queued() {
        let store = MemoryQueueStore::new();
        let result = store.leave_queue("ghost").await;
        assert!(matches!(result, Err(MatchmakerError::NotQueued(_))));
    }

    #[tokio::test]
    async fn join_then_leave_restores_empty_state() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        store.leave_queue("p1").await.unwrap();
        assert_eq!(store.size(Tier::Novice).await.unwrap(), 0);
        assert!(store.leave_queue("p1").await.is_err());
    }

    #[tokio::test]
    async fn pop_lowest_respects_score_order() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p4", 4.0).await.unwrap();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        store.join_queue(Tier::Novice, "p3", 3.0).await.unwrap();
        store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();
        let popped = store.pop_lowest(Tier::Novice, 4).await.unwrap();
        let order: Vec<&str> = popped.iter().map(|e| e.player_id.as_str()).collect();
        assert_eq!(order, vec!["p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn pop_lowest_returns_fewer_than_n_when_tier_short() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();
        let popped = store.pop_lowest(Tier::Novice, 4).await.unwrap();
        assert_eq!(popped.len(), 2);
    }

    #[tokio::test]
    async fn rewind_restores_multiset_after_failed_drain() {
        let store = MemoryQueueStore::new();
        for (id, score) in [("p1", 1.0), ("p2", 2.0), ("p3", 3.0), ("p4", 4.0)] {
            store.join_queue(Tier::Novice, id, score).await.unwrap();
        }
        let before = store.size(Tier::Novice).await.unwrap();
        let popped = store.pop_lowest(Tier::Novice, 4).await.unwrap();
        assert_eq!(store.size(Tier::Novice).await.unwrap(), 0);
        store.reinsert(Tier::Novice, popped).await.unwrap();
        assert_eq!(store.size(Tier::Novice).await.unwrap(), before);
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_stale_entries() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "fresh", 1.0).await.unwrap();
        {
            let mut inner = store.inner.lock().unwrap();
            let tier_set = inner.tiers.get_mut(&Tier::Novice).unwrap();
            for entry in tier_set.values_mut() {
                if entry.player_id == "fresh" {
                    entry.enqueued_at = epoch_seconds() - 1000.0;
                }
            }
        }
        store.join_queue(Tier::Novice, "new", 2.0).await.unwrap();
        let swept = store
            .sweep_expired(Tier::Novice, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].player_id, "fresh");
        assert_eq!(store.size(Tier::Novice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn position_reports_one_indexed_rank() {
        let store = MemoryQueueStore::new();
        store.join_queue(Tier::Novice, "p1", 1.0).await.unwrap();
        store.join_queue(Tier::Novice, "p2", 2.0).await.unwrap();
        assert_eq!(store.position(Tier::Novice, "p1").await.unwrap(), Some(1));
        assert_eq!(store.position(Tier::Novice, "p2").await.unwrap(), Some(2));
        assert_eq!(store.position(Tier::Guard, "p1").await.unwrap(), None);
    }
}
