mod compute_client;
mod rpc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use matchmaker_core::{
    ComputeNodeClient, Dispatcher, MatchPool, MatchmakerConfig, NodeInfo, NodeRegistry,
    QueueStore, RedisQueueStore, RedisRouterStore, RouterStore,
};
use protocol::{MatchedPush, Tier};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::compute_client::HttpComputeNodeClient;

/// Command-line surface for the matchmaker process. `clap` is used the way
/// the rest of the retrieval pack's servers parse startup flags; the
/// teacher itself took no arguments and bound a fixed port.
#[derive(Parser, Debug)]
#[command(name = "matchmaker-server")]
struct Args {
    /// Path to the matchmaker TOML config. Missing file falls back to defaults.
    #[arg(long, default_value = "matchmaker.toml")]
    config_file: String,

    /// This process's own identity, used only to label its own discovery
    /// heartbeat/log lines; the matchmaker core itself is stateless across
    /// restarts (spec section 6's `--nodeID`).
    #[arg(long, default_value = "matchmaker-0")]
    node_id: String,

    /// Default `tracing` filter directive, overridden by `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address to bind the HTTP RPC surface on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
}

/// Shared application state behind every axum handler. `config` is
/// reloadable independently of the Match Pools, which were built from a
/// fixed snapshot at startup — mirrors the teacher's `AppState.configs`
/// hot-reload, which similarly never retroactively resizes rooms already
/// open under the old config.
pub struct AppState {
    pub config: RwLock<MatchmakerConfig>,
    pub config_file: String,
    pub queue_store: Arc<dyn QueueStore>,
    pub router_store: Arc<dyn RouterStore>,
    pub registry: Arc<NodeRegistry>,
    pub pools: HashMap<Tier, Arc<MatchPool>>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}={}", env!("CARGO_CRATE_NAME"), args.log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    tracing::info!(node_id = %args.node_id, "matchmaker starting");

    let config = match MatchmakerConfig::load(&args.config_file).await {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "falling back to default matchmaker config");
            MatchmakerConfig::default()
        }
    };

    let queue_store: Arc<dyn QueueStore> = match RedisQueueStore::connect(&config.redis_url).await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "failed to connect queue store to redis");
            panic!("cannot start without a queue store: {e}");
        }
    };

    let router_store: Arc<dyn RouterStore> =
        match RedisRouterStore::connect(&config.redis_url, config.router_ttl()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                tracing::error!(error = %e, "failed to connect router store to redis");
                panic!("cannot start without a router store: {e}");
            }
        };

    let registry = Arc::new(NodeRegistry::new(config.node_ttl()));
    let config = Arc::new(config);

    let (results_tx, results_rx) = mpsc::channel(128);
    let (notify_tx, mut notify_rx) = mpsc::channel::<MatchedPush>(128);

    let mut pools = HashMap::new();
    for tier in Tier::ALL {
        let pool = Arc::new(MatchPool::new(
            tier,
            queue_store.clone(),
            router_store.clone(),
            registry.clone(),
            config.clone(),
            results_tx.clone(),
        ));
        let runner = pool.clone();
        tokio::spawn(async move { runner.run().await });
        pools.insert(tier, pool);
    }
    drop(results_tx);

    let client: Arc<dyn ComputeNodeClient> = Arc::new(HttpComputeNodeClient::new());
    let dispatcher = Arc::new(Dispatcher::new(
        client,
        queue_store.clone(),
        router_store.clone(),
        registry.clone(),
        config.clone(),
        notify_tx,
    ));
    tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run(results_rx).await }
    });

    // Actual delivery of `MatchedPush` to an entry node's live connection is
    // the entry node's concern, not this service's — logged here so the
    // matchmaker's own responsibility (deciding and recording the match)
    // stays observable independent of whatever transport carries it onward.
    tokio::spawn(async move {
        while let Some(push) = notify_rx.recv().await {
            tracing::info!(
                player = %push.player_id,
                room = %push.room_id,
                compute_node = %push.compute_node_id,
                "player matched"
            );
        }
    });

    let state = Arc::new(AppState {
        config: RwLock::new((*config).clone()),
        config_file: args.config_file,
        queue_store,
        router_store,
        registry,
        pools: pools.clone(),
    });

    let app = Router::new()
        .route("/join_queue", post(rpc::join_queue))
        .route("/leave_queue", post(rpc::leave_queue))
        .route("/query_status", post(rpc::query_status))
        .route("/register_node", put(register_node))
        .route("/reload", get(reload_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await.unwrap();
    tracing::info!(address = %args.listen, "matchmaker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pools, dispatcher))
        .await
        .unwrap();
}

/// Waits for Ctrl-C, then transitions every Match Pool to `Stopping` and
/// stops the Dispatcher (spec section 4.4/5: in-flight work must drain or be
/// abandoned within a bounded grace rather than being killed outright).
/// Abandoned `MatchResult`s are not persisted anywhere themselves; any player
/// they carried is reconciled back to `waiting` on the next process start
/// through the Router Store, per section 5's shutdown note.
async fn shutdown_signal(pools: HashMap<Tier, Arc<MatchPool>>, dispatcher: Arc<Dispatcher>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received, draining in-flight work");

    for pool in pools.values() {
        pool.stop();
    }
    dispatcher.stop();

    const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    tracing::info!("shutdown grace window elapsed");
}

/// Heartbeat/registration call a compute node makes against this matchmaker
/// to announce itself or refresh its `last_seen`. Stands in for a real
/// discovery backend (etcd/consul) integration, which the spec leaves
/// unspecified — any transport that eventually calls
/// `NodeRegistry::apply_discovery_event` satisfies the module.
#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    node_id: String,
    address: String,
    load: f64,
    version: String,
    weight: u32,
}

async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterNodeRequest>,
) -> &'static str {
    state.registry.put(NodeInfo {
        node_id: request.node_id,
        address: request.address,
        load: request.load,
        version: request.version,
        weight: request.weight,
        last_seen: Instant::now(),
    });
    "ok"
}

/// Reloads `matchmaker.toml` into the shared, routing-facing config copy.
/// Mirrors the teacher's `/reload` admin endpoint; unlike the teacher's
/// single `HashMap` swap, running Match Pools keep their own startup
/// snapshot and are not retroactively resized by this call.
async fn reload_handler(State(state): State<Arc<AppState>>) -> String {
    match MatchmakerConfig::load(&state.config_file).await {
        Ok(new_config) => {
            *state.config.write().await = new_config;
            "config reloaded".to_string()
        }
        Err(e) => format!("config reload failed: {e}"),
    }
}
