//! Matchmaking and room-dispatch core: queue storage, router storage, the
//! compute-node registry, and the Match Pool / Dispatcher pipeline that
//! turns queued players into rooms.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod match_pool;
pub mod node_registry;
pub mod queue_store;
pub mod router_store;

pub use config::MatchmakerConfig;
pub use dispatcher::{ComputeNodeClient, Dispatcher};
pub use error::{MatchmakerError, Result};
pub use match_pool::{MatchPool, PoolState};
pub use node_registry::{NodeInfo, NodeRegistry, SelectionStrategy};
pub use queue_store::{MemoryQueueStore, QueueEntry, QueueStore, RedisQueueStore};
pub use router_store::{MemoryRouterStore, RedisRouterStore, RouterEntry, RouterStore};
