//! State-machine caller contract: the collaborator that feeds committed
//! entries and snapshot work to the user state machine on its own task,
//! keeping user code off the node's critical section.

#[cfg(test)]
use mockall::automock;

use std::sync::Arc;
use std::sync::Weak;

use crate::core::Done;
use crate::core::InstallSnapshotDone;
use crate::core::Node;
use crate::core::SaveSnapshotDone;
use crate::storage::LogManager;
use crate::storage::StateMachine;
use crate::Error;
use crate::Result;

pub struct FsmCallerOptions {
    /// Upgraded per callback; the caller must not keep the node alive.
    pub node: Weak<Node>,
    pub log_manager: Arc<dyn LogManager>,
    pub fsm: Arc<dyn StateMachine>,
    pub last_applied_index: i64,
}

/// Contract of the state-machine caller collaborator.
///
/// Every method is a non-blocking enqueue onto the caller's task; the
/// node may invoke them while holding its mutex. The caller owns the
/// ordering guarantee that entries are applied in index order and that
/// `on_committed` never runs concurrently with a snapshot load.
#[cfg_attr(test, automock)]
pub trait FsmCaller: Send + Sync + 'static {
    fn init(
        &self,
        options: FsmCallerOptions,
    ) -> Result<()>;

    /// New committed index from the commit manager; applies entries up to
    /// it and runs their completions.
    fn on_committed(
        &self,
        committed_index: i64,
    );

    /// Drives the user state machine's snapshot save, then settles it
    /// through the continuation.
    fn on_snapshot_save(
        &self,
        done: SaveSnapshotDone,
    );

    /// Drives the user state machine's snapshot load, then settles it
    /// through the continuation.
    fn on_snapshot_load(
        &self,
        done: InstallSnapshotDone,
    );

    /// Completes a rejected operation on the caller's task so user code
    /// never runs under the node mutex.
    fn on_cleared(
        &self,
        index: i64,
        done: Option<Done>,
        error: Error,
    );

    /// Signals leadership start; the returned completion is attached to
    /// the new leader's configuration entry and fires once it commits.
    fn on_leader_start(&self) -> Done;

    fn on_leader_stop(&self);

    /// Drains the apply queue and signals the user state machine, then
    /// runs `done`.
    fn shutdown(
        &self,
        done: Option<Done>,
    );
}
