//! Commit manager contract: quorum tracking for pending applications.

#[cfg(test)]
use mockall::automock;

use std::sync::Arc;

use crate::core::Done;
use crate::core::FsmCaller;
use crate::membership::Configuration;
use crate::membership::PeerId;
use crate::Result;

pub struct CommitManagerOptions {
    /// Notified with every newly committed index.
    pub waiter: Arc<dyn FsmCaller>,
    pub last_committed_index: i64,
    pub max_pending_size: usize,
}

/// Contract of the commit manager collaborator.
///
/// Pending applications are registered in log order, each with the peer
/// set its quorum is computed against. Once a quorum of that set has
/// acknowledged stability up to an index, the manager reports the new
/// committed index to its waiter, which applies entries and runs the
/// registered completions.
#[cfg_attr(test, automock)]
pub trait CommitManager: Send + Sync + 'static {
    fn init(
        &self,
        options: CommitManagerOptions,
    ) -> Result<()>;

    /// Restarts quorum tracking at `new_pending_index` (leader start,
    /// snapshot install).
    fn reset_pending_index(
        &self,
        new_pending_index: i64,
    );

    /// Registers the next pending entry under the peer set its commit
    /// quorum must be computed against.
    fn append_pending_application(
        &self,
        conf: Configuration,
        done: Option<Done>,
    );

    /// Records that `peer`'s log is stable up to `log_index`. Reentrant:
    /// called from the leader's own stable closure and from replicator
    /// tasks alike.
    fn set_stable_at_peer(
        &self,
        log_index: i64,
        peer: PeerId,
    );

    /// Follower side: adopts the leader's committed index.
    fn set_last_committed_index(
        &self,
        committed_index: i64,
    );

    /// Fails every queued application (stepdown path); their completions
    /// run with an error.
    fn clear_pending_applications(&self);
}
