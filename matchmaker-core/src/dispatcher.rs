//! Dispatcher (spec section 4.5): takes drained `MatchResult`s off the
//! Match Pools' shared channel and turns each into a `CreateRoom` RPC
//! against the chosen compute node. Successes record the room's compute
//! topic in the Router Store and push a match notification; failures put
//! the node in local cool-down and rewind the whole group back onto its
//! tier queue with an age boost, so the table stays idempotent to retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use protocol::{ComputeTopic, CreateRoomRequest, CreateRoomResponse, MatchResult, MatchedPush};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::MatchmakerConfig;
use crate::error::{MatchmakerError, Result};
use crate::node_registry::NodeRegistry;
use crate::queue_store::{QueueEntry, QueueStore};
use crate::router_store::RouterStore;

/// The `CreateRoom` RPC, abstracted so the Dispatcher can be driven by a
/// fake client in tests instead of a real network call.
#[async_trait]
pub trait ComputeNodeClient: Send + Sync {
    async fn create_room(
        &self,
        address: &ComputeTopic,
        request: CreateRoomRequest,
    ) -> Result<CreateRoomResponse>;
}

/// Consumes `MatchResult`s from every Match Pool and resolves each into a
/// room or a rewind. One Dispatcher process-wide, but it owns one consumer
/// task per destination compute-node address (spec section 5): results for
/// the same address are handled in arrival order, but two different
/// addresses never block each other behind one slow RPC.
pub struct Dispatcher {
    client: Arc<dyn ComputeNodeClient>,
    queue_store: Arc<dyn QueueStore>,
    router_store: Arc<dyn RouterStore>,
    registry: Arc<NodeRegistry>,
    config: Arc<MatchmakerConfig>,
    notifications: mpsc::Sender<MatchedPush>,
    cancel: CancellationToken,
    /// Lazily spawned per-address worker queues, keyed by compute-node
    /// address. A worker task drains its queue until its sender is dropped
    /// or the dispatcher is cancelled.
    workers: Mutex<HashMap<ComputeTopic, mpsc::Sender<MatchResult>>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ComputeNodeClient>,
        queue_store: Arc<dyn QueueStore>,
        router_store: Arc<dyn RouterStore>,
        registry: Arc<NodeRegistry>,
        config: Arc<MatchmakerConfig>,
        notifications: mpsc::Sender<MatchedPush>,
    ) -> Self {
        Dispatcher {
            client,
            queue_store,
            router_store,
            registry,
            config,
            notifications,
            cancel: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Reads `results` off the shared channel and fans each one out to the
    /// worker task for its destination address, spawning that worker on
    /// first use. Returns once `results` closes or the dispatcher is
    /// cancelled; outstanding per-address workers drain whatever is already
    /// queued to them before their own cancellation check fires.
    pub async fn run(self: Arc<Self>, mut results: mpsc::Receiver<MatchResult>) {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = results.recv() => match result {
                    Some(r) => r,
                    None => break,
                },
            };
            self.clone().route(result).await;
        }
    }

    /// Sends `result` to its address's worker queue, spawning the worker
    /// the first time this address is seen.
    async fn route(self: Arc<Self>, result: MatchResult) {
        let address = result.chosen_node_address.clone();
        let sender = {
            let mut workers = self.workers.lock().unwrap();
            workers
                .entry(address.clone())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(64);
                    tokio::spawn(self.clone().run_worker(rx));
                    tx
                })
                .clone()
        };
        if sender.send(result).await.is_err() {
            tracing::error!(address = %address, "dispatcher worker gone, dropping match result");
        }
    }

    /// One per-address consumer: processes its queue strictly in arrival
    /// order, independent of every other address's worker.
    async fn run_worker(self: Arc<Self>, mut queue: mpsc::Receiver<MatchResult>) {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = queue.recv() => match result {
                    Some(r) => r,
                    None => break,
                },
            };
            self.handle(result).await;
        }
    }

    async fn handle(&self, result: MatchResult) {
        let request = CreateRoomRequest {
            players: result.players.clone(),
            ruleset_id: result.ruleset_id,
        };

        let outcome = tokio::time::timeout(
            self.config.create_room_timeout(),
            self.client.create_room(&result.chosen_node_address, request),
        )
        .await;

        let response = match outcome {
            Ok(Ok(response)) if response.success => response,
            Ok(Ok(response)) => {
                tracing::warn!(
                    node = %result.chosen_node_id,
                    message = %response.message,
                    "compute node rejected create_room"
                );
                // Server-side rejection, not a transport problem: rewind without
                // cooling the node down (spec 4.5/7 keep these two distinct).
                self.fail(result, false).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(node = %result.chosen_node_id, error = %e, "create_room rpc failed");
                self.fail(result, true).await;
                return;
            }
            Err(_) => {
                tracing::warn!(node = %result.chosen_node_id, "create_room rpc timed out");
                self.fail(result, true).await;
                return;
            }
        };

        for player_id in result.players.keys() {
            if let Err(e) = self
                .router_store
                .set_compute_topic(player_id, &result.chosen_node_address, &result.chosen_node_id)
                .await
            {
                tracing::error!(player = %player_id, error = %e, "failed to record compute topic after create_room");
            }
            let push = MatchedPush {
                player_id: player_id.clone(),
                compute_node_id: result.chosen_node_id.clone(),
                compute_node_address: result.chosen_node_address.clone(),
                room_id: response.room_id.clone(),
            };
            if self.notifications.send(push).await.is_err() {
                tracing::warn!("notification channel closed, dropping matched push");
            }
        }
    }

    /// Rewinds the whole group, age-boosted (lowest possible `score`) so it
    /// drains ahead of newer entries next tick. `cooldown` distinguishes the
    /// two rollback policies spec 4.5/7 keep separate: transport error/timeout
    /// cools the node down locally, a server-side `success=false` does not —
    /// the node itself may be perfectly healthy, just rejecting this room.
    async fn fail(&self, result: MatchResult, cooldown: bool) {
        if cooldown {
            self.registry
                .mark_cooldown(&result.chosen_node_id, self.config.node_cooldown());
        }

        // MatchResult carries no tier field; pool_id is formatted "<tier>-<suffix>"
        // by the Match Pool, so it is the only place left to recover it from.
        let tier = parse_tier_from_pool_id(&result.pool_id).unwrap_or(protocol::Tier::Novice);

        // `enqueued_at` must stay a real, current timestamp: it is the true
        // age `sweep_expired` checks against `maxWait`, independent of the
        // `score` ordering boost below (DESIGN.md queue-score decision). A
        // zeroed `enqueued_at` reads as infinitely old and gets swept on the
        // very next tick, before the group ever gets a chance to redrain.
        let now = crate::queue_store::epoch_seconds();
        let entries: Vec<QueueEntry> = result
            .players
            .keys()
            .map(|player_id| QueueEntry {
                player_id: player_id.clone(),
                tier,
                score: f64::MIN_POSITIVE,
                enqueued_at: now,
            })
            .collect();

        if let Err(e) = self.queue_store.reinsert(tier, entries).await {
            tracing::error!(tier = %tier, error = %e, "rewind after create_room failure dropped players from queue");
        }
    }
}

fn parse_tier_from_pool_id(pool_id: &str) -> Option<protocol::Tier> {
    let prefix = pool_id.split('-').next()?;
    protocol::Tier::ALL.into_iter().find(|t| t.as_key() == prefix)
}
