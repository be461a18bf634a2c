//! Matchmaker configuration (spec section 6), loaded from a TOML file and
//! hot-reloadable the way the teacher's `reload_config` refreshes
//! `GameConfig.json` — same idea, generalized to the full option set.

use crate::error::{MatchmakerError, Result};
use crate::node_registry::SelectionStrategy;
use protocol::Tier;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One band of the closed `tierBands` list: a tier is assigned to a player
/// whose rating is `>= min_rating` and below the next band's `min_rating`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBand {
    pub tier: Tier,
    pub min_rating: f64,
}

/// Recognized configuration options (spec section 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakerConfig {
    /// Pool tick period, in seconds.
    pub match_interval_secs: f64,
    /// Max drains attempted per tick.
    pub batch_size: u32,
    /// Queue-entry age after which the sweeper removes it, in seconds.
    pub max_wait_secs: f64,
    /// Closed list of `(tierName, minRating)`, ascending by `min_rating`.
    pub tier_bands: Vec<TierBand>,
    /// Group size a Match Pool drains (4 for riichi mahjong).
    pub group_size: u32,
    /// Integer the matchmaker passes to `CreateRoom`.
    pub ruleset_id: u32,
    pub selection_strategy: SelectionStrategy,
    /// Default Router Store entry lifetime, in seconds.
    pub router_ttl_secs: u64,
    pub create_room_timeout_secs: f64,
    pub discovery_timeout_secs: f64,
    /// How long a node stays locally cooled-down after an RPC failure,
    /// in seconds. Not in spec's named option list but required by the
    /// Dispatcher's cool-down rule (section 4.5) — local to this node's
    /// cache only, never written back to the discovery backend.
    pub node_cooldown_secs: f64,
    /// TTL after which a NodeInfo is evicted from the registry, in seconds.
    pub node_ttl_secs: f64,
    pub redis_url: String,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        MatchmakerConfig {
            match_interval_secs: 2.0,
            batch_size: 4,
            max_wait_secs: 600.0,
            tier_bands: vec![
                TierBand { tier: Tier::Novice, min_rating: 0.0 },
                TierBand { tier: Tier::Guard, min_rating: 1000.0 },
                TierBand { tier: Tier::Hero, min_rating: 1600.0 },
                TierBand { tier: Tier::Saint, min_rating: 2200.0 },
                TierBand { tier: Tier::Sky, min_rating: 2800.0 },
            ],
            group_size: 4,
            ruleset_id: 0,
            selection_strategy: SelectionStrategy::LeastLoad,
            router_ttl_secs: 120,
            create_room_timeout_secs: 5.0,
            discovery_timeout_secs: 3.0,
            node_cooldown_secs: 30.0,
            node_ttl_secs: 30.0,
            redis_url: "redis://127.0.0.1/".to_string(),
        }
    }
}

impl MatchmakerConfig {
    /// Parses a TOML config file. Missing fields fall back to `Default`.
    pub async fn load(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MatchmakerError::Config(format!("reading {path}: {e}")))?;
        toml::from_str(&raw).map_err(|e| MatchmakerError::Config(format!("parsing {path}: {e}")))
    }

    pub fn match_interval(&self) -> Duration {
        Duration::from_secs_f64(self.match_interval_secs.max(0.0))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_wait_secs.max(0.0))
    }

    pub fn create_room_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.create_room_timeout_secs.max(0.0))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_timeout_secs.max(0.0))
    }

    pub fn node_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.node_cooldown_secs.max(0.0))
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.node_ttl_secs.max(0.0))
    }

    pub fn router_ttl(&self) -> Duration {
        Duration::from_secs(self.router_ttl_secs)
    }

    /// Derives a tier from a rating using `tier_bands`. Bands must be sorted
    /// ascending by `min_rating`; the highest band whose `min_rating` does
    /// not exceed `rating` wins.
    pub fn tier_for_rating(&self, rating: f64) -> Tier {
        let mut chosen = Tier::Novice;
        for band in &self.tier_bands {
            if rating >= band.min_rating {
                chosen = band.tier;
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_bands_classify_ratings() {
        let cfg = MatchmakerConfig::default();
        assert_eq!(cfg.tier_for_rating(0.0), Tier::Novice);
        assert_eq!(cfg.tier_for_rating(999.0), Tier::Novice);
        assert_eq!(cfg.tier_for_rating(1000.0), Tier::Guard);
        assert_eq!(cfg.tier_for_rating(2900.0), Tier::Sky);
    }

    #[test]
    fn parses_minimal_toml_overriding_only_some_fields() {
        let cfg: MatchmakerConfig = toml::from_str("batch_size = 8\n").unwrap();
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.group_size, 4); // falls back to default
    }
}
