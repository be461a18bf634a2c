//! Error taxonomy for the matchmaking core (spec section 7).
//!
//! Stores and RPC clients never swallow an error — they return it here. The
//! Match Pool is the only layer allowed to swallow a *transient* variant,
//! and it must account it via `tracing::warn!` rather than drop it silently.

use thiserror::Error;

/// Every error the matchmaking core can surface.
#[derive(Debug, Error, Clone)]
pub enum MatchmakerError {
    /// `JoinQueue` for a player already present in the inverse index.
    #[error("player {0} is already queued")]
    AlreadyQueued(String),

    /// `LeaveQueue` for a player absent from the inverse index.
    #[error("player {0} is not queued")]
    NotQueued(String),

    /// Node Registry selection found no candidate satisfying I4.
    #[error("no healthy compute node available")]
    NoHealthyNode,

    /// A popped player's `entryTopic` could not be read from the Router Store
    /// during a drain; the whole group must be re-inserted (I3).
    #[error("router entry missing for player {0} during drain")]
    RouterMissing(String),

    /// A `CreateRoom` call did not complete within its budget.
    #[error("rpc to compute node {0} timed out")]
    RpcTimeout(String),

    /// A `CreateRoom` call could not even reach the compute node.
    #[error("rpc to compute node {0} unavailable: {1}")]
    RpcUnavailable(String, String),

    /// The backing store could not run the atomic script/transaction this
    /// operation requires. Fatal per-operation — never guessed around.
    #[error("store atomicity violation during {0}: {1}")]
    StoreAtomicityViolation(String, String),

    /// Shutdown in progress; the caller should stop without rewind side effects.
    #[error("operation cancelled")]
    Cancelled,

    /// A Router Store read found no entry for the player. Distinct from
    /// `RouterMissing`, which is the drain-time, whole-group rewind trigger.
    #[error("no router entry for player {0}")]
    RouterNotFound(String),

    /// Catch-all for backing-store transport errors (connection refused,
    /// protocol errors) that do not fit a more specific variant above.
    #[error("store error: {0}")]
    Store(String),

    /// Config file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl MatchmakerError {
    /// True for errors the Match Pool should swallow and retry on the next
    /// tick rather than propagate to its caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MatchmakerError::NoHealthyNode
                | MatchmakerError::RouterMissing(_)
                | MatchmakerError::RpcTimeout(_)
                | MatchmakerError::RpcUnavailable(_, _)
        )
    }
}

impl From<redis::RedisError> for MatchmakerError {
    fn from(e: redis::RedisError) -> Self {
        MatchmakerError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MatchmakerError>;
