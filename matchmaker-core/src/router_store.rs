//! Router Store (spec section 4.2): maps a player to the entry node carrying
//! their live connection and, once matched, the compute node hosting their
//! room. Entries expire on their own (`routerTtlSecs`) so a crashed entry
//! node cannot pin a player's routing forever.

use crate::error::{MatchmakerError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A player's current routing. `compute_topic`/`compute_node_id` are `None`
/// until `CreateRoom` succeeds and the Dispatcher records the winning
/// compute node. `compute_topic` is the reconnection address; `compute_node_id`
/// is the node's own identity, reported back to players via `QueryStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterEntry {
    pub entry_topic: String,
    pub compute_topic: Option<String>,
    pub compute_node_id: Option<String>,
}

#[async_trait]
pub trait RouterStore: Send + Sync {
    /// Sets (or refreshes) the entry topic for a player, resetting its TTL.
    async fn set_entry_topic(&self, player_id: &str, entry_topic: &str) -> Result<()>;

    /// Sets the compute topic and owning node id for a player once matched,
    /// refreshing its TTL.
    async fn set_compute_topic(&self, player_id: &str, compute_topic: &str, compute_node_id: &str) -> Result<()>;

    /// Returns `RouterNotFound` if no entry exists (expired or never set).
    async fn get(&self, player_id: &str) -> Result<RouterEntry>;

    async fn delete(&self, player_id: &str) -> Result<()>;

    /// Best-effort bulk delete, used when a whole drained group fails and its
    /// players are pushed back to the queue rather than into a room.
    async fn delete_many(&self, player_ids: &[String]) -> Result<()>;
}

fn router_key(player_id: &str) -> String {
    format!("mm:router:{player_id}")
}

pub struct RedisRouterStore {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl RedisRouterStore {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisRouterStore { conn, ttl })
    }
}

#[async_trait]
impl RouterStore for RedisRouterStore {
    async fn set_entry_topic(&self, player_id: &str, entry_topic: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = router_key(player_id);
        let _: () = conn.hset(&key, "entry_topic", entry_topic).await?;
        let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn set_compute_topic(&self, player_id: &str, compute_topic: &str, compute_node_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = router_key(player_id);
        let _: () = conn
            .hset_multiple(
                &key,
                &[("compute_topic", compute_topic), ("compute_node_id", compute_node_id)],
            )
            .await?;
        let _: () = conn.expire(&key, self.ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn get(&self, player_id: &str) -> Result<RouterEntry> {
        let mut conn = self.conn.clone();
        let key = router_key(player_id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        if fields.is_empty() {
            return Err(MatchmakerError::RouterNotFound(player_id.to_string()));
        }
        Ok(RouterEntry {
            entry_topic: fields.get("entry_topic").cloned().unwrap_or_default(),
            compute_topic: fields.get("compute_topic").cloned(),
            compute_node_id: fields.get("compute_node_id").cloned(),
        })
    }

    async fn delete(&self, player_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(router_key(player_id)).await?;
        Ok(())
    }

    async fn delete_many(&self, player_ids: &[String]) -> Result<()> {
        if player_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = player_ids.iter().map(|p| router_key(p)).collect();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

/// In-memory test double. TTL is honored against a monotonic clock rather
/// than wall time so tests can assert expiry without sleeping real seconds.
#[derive(Default)]
pub struct MemoryRouterStore {
    inner: Mutex<HashMap<String, (RouterEntry, Instant)>>,
    ttl: Duration,
}

impl MemoryRouterStore {
    pub fn new(ttl: Duration) -> Self {
        MemoryRouterStore {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl RouterStore for MemoryRouterStore {
    async fn set_entry_topic(&self, player_id: &str, entry_topic: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(player_id.to_string()).or_default();
        entry.0.entry_topic = entry_topic.to_string();
        entry.1 = Instant::now();
        Ok(())
    }

    async fn set_compute_topic(&self, player_id: &str, compute_topic: &str, compute_node_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(player_id.to_string()).or_default();
        entry.0.compute_topic = Some(compute_topic.to_string());
        entry.0.compute_node_id = Some(compute_node_id.to_string());
        entry.1 = Instant::now();
        Ok(())
    }

    async fn get(&self, player_id: &str) -> Result<RouterEntry> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(player_id) {
            Some((entry, at)) if at.elapsed() < self.ttl => Ok(entry.clone()),
            Some(_) => {
                inner.remove(player_id);
                Err(MatchmakerError::RouterNotFound(player_id.to_string()))
            }
            None => Err(MatchmakerError::RouterNotFound(player_id.to_string())),
        }
    }

    async fn delete(&self, player_id: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(player_id);
        Ok(())
    }

    async fn delete_many(&self, player_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in player_ids {
            inner.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryRouterStore::new(Duration::from_secs(60));
        store.set_entry_topic("p1", "entry-a").await.unwrap();
        let entry = store.get("p1").await.unwrap();
        assert_eq!(entry.entry_topic, "entry-a");
        assert_eq!(entry.compute_topic, None);
        assert_eq!(entry.compute_node_id, None);
    }

    #[tokio::test]
    async fn compute_topic_set_after_entry_topic() {
        let store = MemoryRouterStore::new(Duration::from_secs(60));
        store.set_entry_topic("p1", "entry-a").await.unwrap();
        store.set_compute_topic("p1", "compute-b", "node-1").await.unwrap();
        let entry = store.get("p1").await.unwrap();
        assert_eq!(entry.entry_topic, "entry-a");
        assert_eq!(entry.compute_topic, Some("compute-b".to_string()));
        assert_eq!(entry.compute_node_id, Some("node-1".to_string()));
    }

    #[tokio::test]
    async fn get_missing_player_is_router_not_found() {
        let store = MemoryRouterStore::new(Duration::from_secs(60));
        let err = store.get("ghost").await.unwrap_err();
        assert!(matches!(err, MatchmakerError::RouterNotFound(_)));
    }

    #[tokio::test]
    async fn delete_many_clears_a_whole_group() {
        let store = MemoryRouterStore::new(Duration::from_secs(60));
        store.set_entry_topic("p1", "entry-a").await.unwrap();
        store.set_entry_topic("p2", "entry-b").await.unwrap();
        store
            .delete_many(&["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        assert!(store.get("p1").await.is_err());
        assert!(store.get("p2").await.is_err());
    }

    #[tokio::test]
    async fn expired_entry_reports_router_not_found() {
        let store = MemoryRouterStore::new(Duration::from_millis(10));
        store.set_entry_topic("p1", "entry-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = store.get("p1").await.unwrap_err();
        assert!(matches!(err, MatchmakerError::RouterNotFound(_)));
    }
}
