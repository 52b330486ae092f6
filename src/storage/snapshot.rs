//! Snapshot storage contracts: metadata record, reader/writer handles and
//! the storage that vends them.

#[cfg(test)]
use mockall::automock;

use serde::Deserialize;
use serde::Serialize;
use tonic::async_trait;

use crate::membership::Configuration;
use crate::Error;
use crate::Result;

/// Raft metadata persisted next to the user state machine's snapshot bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Index of the last log entry covered by the snapshot.
    pub last_included_index: i64,

    /// Term of the entry at `last_included_index`.
    pub last_included_term: i64,

    /// Peer set in effect at `last_included_index`.
    pub last_configuration: Configuration,
}

/// Read handle over a stored snapshot. Dropping the handle closes it.
#[cfg_attr(test, automock)]
pub trait SnapshotReader: Send + Sync {
    fn load_meta(&self) -> Result<SnapshotMeta>;

    /// Location of the snapshot payload, handed to the user state machine
    /// and advertised to followers during install.
    fn path(&self) -> String;
}

/// Write handle for a snapshot under construction. Dropping the handle
/// discards it unless `save_meta` succeeded.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotWriter: Send {
    /// Pulls the snapshot bytes from `uri` through the file-transfer
    /// service (snapshot install path).
    async fn copy(
        &mut self,
        uri: &str,
    ) -> Result<()>;

    /// Atomically persists the metadata record, completing the snapshot.
    fn save_meta(&mut self) -> Result<()>;

    /// Records a terminal error on the snapshot (e.g. a save superseded by
    /// a newer installed snapshot).
    fn set_error(
        &mut self,
        error: Error,
    );

    fn path(&self) -> String;
}

/// Contract of the snapshot storage collaborator.
#[cfg_attr(test, automock)]
pub trait SnapshotStorage: Send + Sync + 'static {
    fn init(&self) -> Result<()>;

    /// Opens the most recent complete snapshot, if any.
    fn open(&self) -> Result<Option<Box<dyn SnapshotReader>>>;

    /// Starts a new snapshot carrying `meta`.
    fn create(
        &self,
        meta: SnapshotMeta,
    ) -> Result<Box<dyn SnapshotWriter>>;
}
