//! Wire types shared between the matchmaker and its collaborators: entry
//! nodes (players waiting to be matched) and compute nodes (rooms hosting
//! games). Everything here is transport-agnostic serde data; the matchmaker
//! binary decides how it travels (HTTP/JSON today).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque stable player identifier, as issued by the authentication layer
/// (out of scope here — we only ever see the string).
pub type PlayerId = String;

/// Addressable name of the entry node holding a player's live connection.
pub type EntryTopic = String;

/// Addressable name of the compute node hosting a player's room.
pub type ComputeTopic = String;

/// Coarse skill bucket used to partition the matchmaking queues. Assigned
/// from a player's rating by fixed, non-overlapping bands (`tierBands` in
/// the matchmaker config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Novice,
    Guard,
    Hero,
    Saint,
    Sky,
}

impl Tier {
    /// All tiers in ascending rating order.
    pub const ALL: [Tier; 5] = [
        Tier::Novice,
        Tier::Guard,
        Tier::Hero,
        Tier::Saint,
        Tier::Sky,
    ];

    /// The stable string used as a Redis key fragment / tier-set name.
    pub fn as_key(&self) -> &'static str {
        match self {
            Tier::Novice => "novice",
            Tier::Guard => "guard",
            Tier::Hero => "hero",
            Tier::Saint => "saint",
            Tier::Sky => "sky",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

/// `JoinQueue(playerID, entryTopic)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinQueueRequest {
    pub player_id: PlayerId,
    pub entry_topic: EntryTopic,
    /// Rating used to derive the tier. Looked up once per call.
    pub rating: f64,
}

/// `JoinQueue` response. Idempotent for an already-queued player: `ok` is
/// still `true`, but `message` reports `AlreadyQueued`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinQueueResponse {
    pub ok: bool,
    pub message: String,
    pub estimate_seconds: Option<f64>,
}

/// `LeaveQueue(playerID)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveQueueRequest {
    pub player_id: PlayerId,
}

/// `LeaveQueue` response. Idempotent for a non-queued player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveQueueResponse {
    pub ok: bool,
    pub message: String,
}

/// Where a player currently sits relative to matchmaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Not queued and not matched; either never joined or already swept.
    Unknown,
    /// In a tier queue awaiting a drain.
    Waiting,
    /// Drained into a room on a compute node.
    Matched,
}

/// `QueryStatus(playerID)` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatusRequest {
    pub player_id: PlayerId,
}

/// `QueryStatus` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatusResponse {
    pub status: MatchStatus,
    /// 1-indexed rank within the tier's ordered set, present only while waiting.
    pub position: Option<u64>,
    pub estimate_seconds: Option<f64>,
    pub compute_node_id: Option<String>,
}

/// One drained group, produced by a Match Pool and consumed exactly once by
/// the Dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub pool_id: String,
    /// playerID -> entryTopic, for the room-creation call and for push-back.
    pub players: HashMap<PlayerId, EntryTopic>,
    pub chosen_node_id: String,
    pub chosen_node_address: String,
    pub ruleset_id: u32,
}

/// `CreateRoom(players, rulesetID)` request sent to a compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub players: HashMap<PlayerId, EntryTopic>,
    pub ruleset_id: u32,
}

/// `CreateRoom` response. `success = true` means the compute node has taken
/// ownership of the players.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub success: bool,
    pub room_id: String,
    pub message: String,
}

/// Tagged inter-node envelope, replacing the source's "any"-typed payload
/// (see REDESIGN FLAGS). `Request`/`Response` carry a correlation id for
/// request/response RPCs; `Push` is a fire-and-forget notification fanned
/// out to one or more entry topics (e.g. "you have been matched").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope<T> {
    Request { id: u64, body: T },
    Response { id: u64, body: T },
    Push { targets: Vec<EntryTopic>, payload: T },
}

/// Push-back payload telling an entry node its player has been matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedPush {
    pub player_id: PlayerId,
    pub compute_node_id: String,
    pub compute_node_address: String,
    pub room_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_key() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_key(), tier.to_string());
        }
    }

    #[test]
    fn tier_orders_by_rating_band() {
        assert!(Tier::Novice < Tier::Guard);
        assert!(Tier::Saint < Tier::Sky);
    }

    #[test]
    fn envelope_tag_round_trips_json() {
        let env = Envelope::Push {
            targets: vec!["entry-1".to_string()],
            payload: MatchedPush {
                player_id: "p1".into(),
                compute_node_id: "g1".into(),
                compute_node_address: "10.0.0.1:9000".into(),
                room_id: "room-abc".into(),
            },
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"kind\":\"push\""));
        let back: Envelope<MatchedPush> = serde_json::from_str(&json).unwrap();
        match back {
            Envelope::Push { targets, .. } => assert_eq!(targets, vec!["entry-1".to_string()]),
            _ => panic!("wrong variant"),
        }
    }
}
