//! Replicator group contract: one replication loop per follower, owned
//! and driven outside the node.

#[cfg(test)]
use mockall::automock;

use std::sync::Arc;
use std::sync::Weak;

use tokio::time::Instant;

use crate::core::CatchUpClosure;
use crate::core::CommitManager;
use crate::core::Node;
use crate::membership::NodeId;
use crate::membership::PeerId;
use crate::storage::LogManager;
use crate::storage::SnapshotStorage;
use crate::Result;

pub struct ReplicatorGroupOptions {
    /// Upgraded per callback; replicators must not keep the node alive.
    pub node: Weak<Node>,
    pub term: i64,
    pub heartbeat_timeout_ms: u64,
    pub log_manager: Arc<dyn LogManager>,
    pub commit_manager: Arc<dyn CommitManager>,
    pub snapshot_storage: Option<Arc<dyn SnapshotStorage>>,
}

/// Contract of the replicator group collaborator.
///
/// Initialized when the node becomes leader; each added replicator runs
/// its follower's append-entries/heartbeat/install-snapshot loop and
/// reports stability through the commit manager.
#[cfg_attr(test, automock)]
pub trait ReplicatorGroup: Send + Sync + 'static {
    fn init(
        &self,
        node_id: NodeId,
        options: ReplicatorGroupOptions,
    ) -> Result<()>;

    fn add_replicator(
        &self,
        peer: PeerId,
    ) -> Result<()>;

    fn stop_replicator(
        &self,
        peer: PeerId,
    );

    fn stop_all(&self);

    /// Registers a catch-up wait for `peer`. The closure always runs:
    /// with success once the peer is within its margin of the leader's
    /// last log index, with `CatchUpTimeout` at `deadline`, or with the
    /// registration failure.
    fn wait_caughtup(
        &self,
        peer: PeerId,
        closure: CatchUpClosure,
        deadline: Instant,
    );

    /// Monotonic timestamp of the last response received from `peer`.
    fn last_response_timestamp(
        &self,
        peer: PeerId,
    ) -> Instant;
}
