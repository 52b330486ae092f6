//! User state machine contract.

use bytes::Bytes;
use tonic::async_trait;

use crate::storage::SnapshotReader;
use crate::storage::SnapshotWriter;
use crate::Result;

/// The replicated application. Implementations receive committed entries
/// and snapshot callbacks from the state-machine caller; every replica of
/// a group applies the same entries in the same order.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Applies one committed `Data` entry. `index` is the entry's log
    /// index; applying must be deterministic across replicas.
    async fn on_apply(
        &self,
        index: i64,
        data: Bytes,
    ) -> Result<()>;

    /// Writes the current state into `writer`. Runs outside the node lock.
    async fn on_snapshot_save(
        &self,
        writer: &mut dyn SnapshotWriter,
    ) -> Result<()>;

    /// Rebuilds state from the snapshot under `reader`.
    async fn on_snapshot_load(
        &self,
        reader: &dyn SnapshotReader,
    ) -> Result<()>;

    fn on_leader_start(&self) {}

    fn on_leader_stop(&self) {}

    fn on_shutdown(&self) {}
}
