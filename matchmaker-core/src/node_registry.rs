//! Node Registry (spec section 4.3): the in-process view of which compute
//! nodes are alive, how loaded they are, and which one a Match Pool should
//! hand a freshly drained group to. Backed by a `RwLock<HashMap>` the same
//! way the retrieval pack's validator registry holds its node table — reads
//! (selection) vastly outnumber writes (discovery events, load updates).

use protocol::ComputeTopic;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::{MatchmakerError, Result};

/// A node's identity and the gauges `SelectNode` reasons over. `last_seen` is
/// bumped by every discovery `Put` event and compared against the
/// configured TTL to decide eligibility (I4).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: ComputeTopic,
    /// Load sample as last reported by the node itself. `<= 0` is the
    /// sentinel for "ignore this node" (spec I4) — a draining or
    /// not-yet-ready node publishes zero rather than being removed from
    /// discovery outright.
    pub load: f64,
    pub version: String,
    /// Static weight used by the `Weighted` strategy; ignored otherwise.
    pub weight: u32,
    pub last_seen: Instant,
}

/// How `NodeRegistry::select_node` picks among eligible candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Candidate with the smallest `load`; ties broken by `node_id`.
    LeastLoad,
    /// Cycles through eligible candidates in `node_id` order.
    RoundRobin,
    /// Uniform-random choice among eligible candidates.
    Random,
    /// Chosen with probability proportional to `weight`.
    Weighted,
}

/// A discovery-backend event, applied via `NodeRegistry::apply_discovery_event`
/// by whatever task owns the actual discovery transport (a watch-stream
/// consumer, or — as wired in `matchmaker-server` — an HTTP heartbeat
/// endpoint compute nodes call directly).
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Put(NodeInfo),
    Delete(String),
}

/// Thread-safe compute-node table. One instance per matchmaker process.
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    node_ttl: Duration,
    round_robin_cursor: AtomicU64,
    /// Nodes the Dispatcher has locally cooled down after an RPC failure.
    /// Never written back to the discovery backend — a node evicted here can
    /// still be selected by a peer matchmaker process that hasn't seen the
    /// failure.
    cooldowns: RwLock<HashMap<String, Instant>>,
}

impl NodeRegistry {
    pub fn new(node_ttl: Duration) -> Self {
        NodeRegistry {
            nodes: RwLock::new(HashMap::new()),
            node_ttl,
            round_robin_cursor: AtomicU64::new(0),
            cooldowns: RwLock::new(HashMap::new()),
        }
    }

    /// Excludes `node_id` from selection for `duration`, without touching
    /// its entry in the discovery-backed node table.
    pub fn mark_cooldown(&self, node_id: &str, duration: Duration) {
        self.cooldowns
            .write()
            .unwrap()
            .insert(node_id.to_string(), Instant::now() + duration);
    }

    fn is_cooling_down(&self, node_id: &str) -> bool {
        match self.cooldowns.read().unwrap().get(node_id) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    pub fn put(&self, node: NodeInfo) {
        self.nodes.write().unwrap().insert(node.node_id.clone(), node);
    }

    pub fn delete(&self, node_id: &str) {
        self.nodes.write().unwrap().remove(node_id);
    }

    pub fn update_load(&self, node_id: &str, load: f64) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| MatchmakerError::NoHealthyNode)?;
        node.load = load;
        node.last_seen = Instant::now();
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.read().unwrap().get(node_id).cloned()
    }

    /// A node is eligible for selection when it has reported at least one
    /// discovery heartbeat within `node_ttl`, is not locally cooled down,
    /// and is publishing a positive load sample (I4: `load <= 0` is the
    /// "ignore this node" sentinel, never a selection candidate).
    fn eligible(&self) -> Vec<NodeInfo> {
        let now = Instant::now();
        let nodes = self.nodes.read().unwrap();
        let mut v: Vec<NodeInfo> = nodes
            .values()
            .filter(|n| n.load > 0.0)
            .filter(|n| now.duration_since(n.last_seen) < self.node_ttl)
            .filter(|n| !self.is_cooling_down(&n.node_id))
            .cloned()
            .collect();
        v.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        v
    }

    /// Picks one eligible node per `strategy`. `NoHealthyNode` if none qualify.
    pub fn select_node(&self, strategy: SelectionStrategy) -> Result<NodeInfo> {
        let candidates = self.eligible();
        if candidates.is_empty() {
            return Err(MatchmakerError::NoHealthyNode);
        }
        match strategy {
            SelectionStrategy::LeastLoad => Ok(candidates
                .into_iter()
                .min_by(|a, b| a.load.total_cmp(&b.load).then_with(|| a.node_id.cmp(&b.node_id)))
                .expect("non-empty")),
            SelectionStrategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) as usize
                    % candidates.len();
                Ok(candidates[idx].clone())
            }
            SelectionStrategy::Random => {
                let mut rng = rand::thread_rng();
                Ok(candidates
                    .choose(&mut rng)
                    .expect("non-empty")
                    .clone())
            }
            SelectionStrategy::Weighted => {
                let total: u64 = candidates.iter().map(|n| n.weight.max(1) as u64).sum();
                let mut rng = rand::thread_rng();
                let mut pick = rng.gen_range(0..total);
                for node in &candidates {
                    let w = node.weight.max(1) as u64;
                    if pick < w {
                        return Ok(node.clone());
                    }
                    pick -= w;
                }
                Ok(candidates.last().expect("non-empty").clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies one discovery event. Run from a loop draining the discovery
    /// backend's event stream; kept as a plain method (rather than owning
    /// the stream itself) so callers can pick their own transport.
    pub fn apply_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Put(node) => self.put(node),
            DiscoveryEvent::Delete(id) => self.delete(&id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, load: f64, weight: u32) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            address: format!("{id}:9000"),
            load,
            version: "1".to_string(),
            weight,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn select_node_on_empty_registry_is_no_healthy_node() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        let err = registry.select_node(SelectionStrategy::LeastLoad).unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
    }

    #[test]
    fn least_load_picks_smallest_load() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("a", 5.0, 1));
        registry.put(node("b", 1.0, 1));
        registry.put(node("c", 3.0, 1));
        let chosen = registry.select_node(SelectionStrategy::LeastLoad).unwrap();
        assert_eq!(chosen.node_id, "b");
    }

    #[test]
    fn least_load_ties_break_by_node_id() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("z", 1.0, 1));
        registry.put(node("a", 1.0, 1));
        let chosen = registry.select_node(SelectionStrategy::LeastLoad).unwrap();
        assert_eq!(chosen.node_id, "a");
    }

    #[test]
    fn zero_or_negative_load_is_never_a_candidate() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("draining", 0.0, 1));
        registry.put(node("broken", -1.0, 1));
        let err = registry.select_node(SelectionStrategy::LeastLoad).unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
        registry.put(node("healthy", 2.0, 1));
        let chosen = registry.select_node(SelectionStrategy::LeastLoad).unwrap();
        assert_eq!(chosen.node_id, "healthy");
    }

    #[test]
    fn expired_node_is_not_eligible() {
        let registry = NodeRegistry::new(Duration::from_millis(1));
        registry.put(node("a", 1.0, 1));
        std::thread::sleep(Duration::from_millis(20));
        let err = registry.select_node(SelectionStrategy::LeastLoad).unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("a", 1.0, 1));
        registry.put(node("b", 1.0, 1));
        let first = registry.select_node(SelectionStrategy::RoundRobin).unwrap();
        let second = registry.select_node(SelectionStrategy::RoundRobin).unwrap();
        assert_ne!(first.node_id, second.node_id);
    }

    #[test]
    fn weighted_never_picks_zero_weight_over_total() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("a", 1.0, 100));
        for _ in 0..20 {
            let chosen = registry.select_node(SelectionStrategy::Weighted).unwrap();
            assert_eq!(chosen.node_id, "a");
        }
    }

    #[test]
    fn update_load_on_unknown_node_is_no_healthy_node() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        let err = registry.update_load("ghost", 3.0).unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
    }

    #[test]
    fn cooled_down_node_is_excluded_without_being_evicted() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.put(node("a", 1.0, 1));
        registry.mark_cooldown("a", Duration::from_secs(30));
        let err = registry.select_node(SelectionStrategy::LeastLoad).unwrap_err();
        assert!(matches!(err, MatchmakerError::NoHealthyNode));
        assert_eq!(registry.len(), 1); // still present in the node table
    }

    #[test]
    fn discovery_delete_removes_node() {
        let registry = NodeRegistry::new(Duration::from_secs(30));
        registry.apply_discovery_event(DiscoveryEvent::Put(node("a", 1.0, 1)));
        assert_eq!(registry.len(), 1);
        registry.apply_discovery_event(DiscoveryEvent::Delete("a".to_string()));
        assert_eq!(registry.len(), 0);
    }
}
