//! Error hierarchy for the replica node core.
//!
//! Errors are grouped by concern: node-level admission/protocol errors,
//! storage collaborator failures, and network failures. Everything folds
//! into the top-level [`Error`] through `From` conversions.

use std::time::Duration;

use config::ConfigError;

use crate::membership::NodeId;
use crate::membership::PeerId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Admission and protocol errors surfaced by the node API
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Storage collaborator failures (log, stable, snapshot)
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Peer communication failures
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Option loading/validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unrecoverable failures requiring node termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Node not initialized yet, or already torn down
    #[error("Node is shutting down or not initialized")]
    ShuttingDown,

    /// Operation requires the leader role
    #[error("Not leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<PeerId> },

    /// A configuration change is already in flight
    #[error("Configuration change already in progress")]
    ConfChangeInFlight,

    /// Malformed peer id, mismatched peer set, or illegal call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Node already registered under this (group, peer) id
    #[error("Node {0} already exists")]
    Duplicate(NodeId),

    /// Snapshot save superseded by a newer installed snapshot
    #[error("Snapshot at index {index} is stale (local snapshot index {snapshot_index})")]
    Stale { index: i64, snapshot_index: i64 },

    /// Snapshot save or load already running
    #[error("Busy: {0}")]
    Busy(&'static str),

    /// New peer failed to catch up with the leader's log in time
    #[error("Peer {0} catch-up timed out")]
    CatchUpTimeout(PeerId),

    /// No storage driver registered for the URI scheme
    #[error("No storage driver for uri: {0}")]
    StorageUnavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during log/snapshot operations
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization failures for persisted data
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Log manager subsystem failures
    #[error("Log manager failure: {0}")]
    LogManager(String),

    /// Stable storage (term + vote) failures
    #[error("Stable storage failure: {0}")]
    StableStorage(String),

    /// Snapshot creation/restoration failures
    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    /// Checksum or record validation failures
    #[error("Data corruption detected at {location}")]
    Corruption { location: String },
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Peer communication timeout
    #[error("Connection timeout to {peer} after {duration:?}")]
    Timeout { peer: PeerId, duration: Duration },

    /// Persistent connection failures
    #[error("Connect failed: {0}")]
    ConnectError(String),

    /// gRPC status code errors
    #[error(transparent)]
    Status(#[from] Box<tonic::Status>),

    /// A completion channel closed before delivering its result
    #[error("Completion channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        NetworkError::Status(Box::new(status)).into()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        StorageError::Bincode(e).into()
    }
}
