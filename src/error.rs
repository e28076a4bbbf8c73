use std::io;

use thiserror::Error;

/// Errors reported through a failed `DhtFuture`.
///
/// Per-contact failures are absorbed inside lookups and stores; only whole-operation failures
/// surface as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DhtError {
    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("message was filtered before leaving the node")]
    Filtered,

    #[error("no contacts to query")]
    NoContacts,

    #[error("node id collision persisted after regenerating the local id")]
    PersistentCollision,

    #[error("routing table is stale")]
    StaleRoutingTable,

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("store failed: {0}")]
    StoreFailed(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("node is shut down")]
    Shutdown,

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

impl From<io::Error> for DhtError {
    fn from(err: io::Error) -> Self {
        DhtError::Io(err.to_string())
    }
}

impl From<bincode::Error> for DhtError {
    fn from(err: bincode::Error) -> Self {
        DhtError::Decode(err.to_string())
    }
}
