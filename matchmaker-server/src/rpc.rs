//! HTTP/JSON RPC surface (spec section 3): `JoinQueue`, `LeaveQueue`,
//! `QueryStatus`. Handlers translate the wire types in `protocol` into
//! calls against the matchmaker-core stores, the way the teacher's
//! `websocket_handler` translates wire bytes into `AppState` operations.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use matchmaker_core::MatchmakerError;
use protocol::{
    JoinQueueRequest, JoinQueueResponse, LeaveQueueRequest, LeaveQueueResponse, MatchStatus,
    QueryStatusRequest, QueryStatusResponse,
};

use crate::AppState;

fn status_for(error: &MatchmakerError) -> StatusCode {
    match error {
        MatchmakerError::AlreadyQueued(_) | MatchmakerError::NotQueued(_) => StatusCode::CONFLICT,
        MatchmakerError::NoHealthyNode | MatchmakerError::RouterMissing(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        MatchmakerError::RpcTimeout(_) | MatchmakerError::RpcUnavailable(_, _) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn join_queue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JoinQueueRequest>,
) -> impl IntoResponse {
    let tier = state.config.read().await.tier_for_rating(request.rating);

    if let Err(e) = state
        .router_store
        .set_entry_topic(&request.player_id, &request.entry_topic)
        .await
    {
        tracing::error!(player = %request.player_id, error = %e, "failed to record entry topic");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(JoinQueueResponse {
                ok: false,
                message: e.to_string(),
                estimate_seconds: None,
            }),
        );
    }

    // Within a tier, score is purely time-of-arrival (spec 4.1's default
    // choice): the inter-tier skill split already happened via `tier`
    // itself, so re-using `rating` again as the intra-tier sort key would
    // let high-rated players perpetually cut ahead of players who have
    // been waiting longer — the opposite of the fairness goal in section 1.
    match state.queue_store.join_queue(tier, &request.player_id, 0.0).await {
        Ok(()) => {
            if let Some(pool) = state.pools.get(&tier) {
                pool.nudge();
            }
            let estimate = estimate_wait(&state, tier).await;
            (
                StatusCode::OK,
                Json(JoinQueueResponse {
                    ok: true,
                    message: "queued".to_string(),
                    estimate_seconds: estimate,
                }),
            )
        }
        Err(MatchmakerError::AlreadyQueued(_)) => (
            StatusCode::OK,
            Json(JoinQueueResponse {
                ok: true,
                message: "already queued".to_string(),
                estimate_seconds: estimate_wait(&state, tier).await,
            }),
        ),
        Err(e) => (
            status_for(&e),
            Json(JoinQueueResponse {
                ok: false,
                message: e.to_string(),
                estimate_seconds: None,
            }),
        ),
    }
}

pub async fn leave_queue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LeaveQueueRequest>,
) -> impl IntoResponse {
    let _ = state.router_store.delete(&request.player_id).await;
    match state.queue_store.leave_queue(&request.player_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(LeaveQueueResponse { ok: true, message: "left".to_string() }),
        ),
        Err(MatchmakerError::NotQueued(_)) => (
            StatusCode::OK,
            Json(LeaveQueueResponse { ok: true, message: "not queued".to_string() }),
        ),
        Err(e) => (
            status_for(&e),
            Json(LeaveQueueResponse { ok: false, message: e.to_string() }),
        ),
    }
}

pub async fn query_status(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryStatusRequest>,
) -> impl IntoResponse {
    let router_entry = state.router_store.get(&request.player_id).await;

    if let Ok(entry) = &router_entry {
        if entry.compute_topic.is_some() {
            return Json(QueryStatusResponse {
                status: MatchStatus::Matched,
                position: None,
                estimate_seconds: None,
                compute_node_id: entry.compute_node_id.clone(),
            });
        }
    }

    for tier in protocol::Tier::ALL {
        if let Ok(Some(position)) = state.queue_store.position(tier, &request.player_id).await {
            let estimate = estimate_wait_for_position(&state, tier, position).await;
            return Json(QueryStatusResponse {
                status: MatchStatus::Waiting,
                position: Some(position),
                estimate_seconds: estimate,
                compute_node_id: None,
            });
        }
    }

    Json(QueryStatusResponse {
        status: MatchStatus::Unknown,
        position: None,
        estimate_seconds: None,
        compute_node_id: None,
    })
}

/// Estimated wait for a brand-new entry: its position is "last in line"
/// (current tier size), run through the same rate-based model as any other
/// position (Open Question 2: position / recent drain rate).
async fn estimate_wait(state: &Arc<AppState>, tier: protocol::Tier) -> Option<f64> {
    let size = state.queue_store.size(tier).await.ok()?;
    estimate_wait_for_position(state, tier, size.max(1)).await
}

async fn estimate_wait_for_position(
    state: &Arc<AppState>,
    tier: protocol::Tier,
    position: u64,
) -> Option<f64> {
    let pool = state.pools.get(&tier)?;
    if let Some(eta) = pool.eta_seconds(position) {
        return Some(eta);
    }
    // No pool tick has drained anyone yet; fall back to one full tick per
    // batch of `groupSize` players ahead, the best a priori estimate.
    let config = state.config.read().await;
    let group_size = config.group_size.max(1) as f64;
    Some(((position as f64) / group_size).ceil() * config.match_interval_secs)
}
