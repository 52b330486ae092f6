//! Continuation objects re-entering the node when collaborators finish.
//!
//! Each continuation owns a strong node reference for its lifetime, so a
//! node cannot be destroyed while a snapshot save/load or a catch-up wait
//! is still outstanding.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use crate::core::Node;
use crate::membership::PeerId;
use crate::storage::SnapshotMeta;
use crate::storage::SnapshotStorage;
use crate::storage::SnapshotWriter;
use crate::NodeError;
use crate::Result;

/// Completion callback attached to client-facing operations. Invoked
/// exactly once with the operation's outcome; never silently dropped.
pub type Done = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Continuation of a `snapshot()` call, handed to the state-machine
/// caller. The caller obtains a writer through [`start`](Self::start),
/// streams the user state machine's snapshot into it, and finishes with
/// [`run`](Self::run).
pub struct SaveSnapshotDone {
    node: Arc<Node>,
    storage: Arc<dyn SnapshotStorage>,
    writer: Option<Box<dyn SnapshotWriter>>,
    meta: Option<SnapshotMeta>,
    done: Option<Done>,
}

impl SaveSnapshotDone {
    pub(crate) fn new(
        node: Arc<Node>,
        storage: Arc<dyn SnapshotStorage>,
        done: Option<Done>,
    ) -> Self {
        Self {
            node,
            storage,
            writer: None,
            meta: None,
            done,
        }
    }

    /// Begins the snapshot: creates a writer carrying `meta`.
    pub fn start(
        &mut self,
        meta: SnapshotMeta,
    ) -> Result<&mut dyn SnapshotWriter> {
        let writer = self.storage.create(meta.clone())?;
        self.meta = Some(meta);
        Ok(self.writer.insert(writer).as_mut())
    }

    /// Completes the save: settles the snapshot against the node's state,
    /// then fires the user completion.
    pub async fn run(
        mut self,
        result: Result<()>,
    ) {
        let outcome = match (result, self.meta.take()) {
            (Ok(()), Some(meta)) => match self.writer.as_deref_mut() {
                Some(writer) => {
                    self.node
                        .on_snapshot_save_done(meta.last_included_index, writer)
                        .await
                }
                None => Err(NodeError::InvalidArgument(
                    "snapshot save completed without a writer".into(),
                )
                .into()),
            },
            (Ok(()), None) => Err(NodeError::InvalidArgument(
                "snapshot save completed without start()".into(),
            )
            .into()),
            (Err(e), _) => {
                self.node.on_snapshot_save_aborted().await;
                Err(e)
            }
        };

        if let Err(e) = &outcome {
            warn!("snapshot save did not complete: {}", e);
        }
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

/// Continuation of a snapshot install, handed to the state-machine caller
/// once the snapshot bytes are fetched and persisted. [`run`](Self::run)
/// settles the node's log against the installed snapshot and releases the
/// pending RPC response.
pub struct InstallSnapshotDone {
    node: Arc<Node>,
    resp_tx: oneshot::Sender<Result<()>>,
}

impl InstallSnapshotDone {
    pub(crate) fn new(
        node: Arc<Node>,
        resp_tx: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self { node, resp_tx }
    }

    pub async fn run(
        self,
        result: Result<()>,
    ) {
        let outcome = match result {
            Ok(()) => {
                self.node.on_snapshot_load_done().await;
                Ok(())
            }
            Err(e) => {
                self.node.discard_loading_snapshot().await;
                Err(e)
            }
        };
        if self.resp_tx.send(outcome).is_err() {
            warn!("install snapshot response receiver dropped");
        }
    }
}

/// Continuation of a catch-up wait registered with the replicator group
/// during `add_peer`. The group invokes [`run`](Self::run) when the new
/// peer's match index comes within `min_margin` of the leader's last log
/// index, or when the wait deadline expires.
pub struct CatchUpClosure {
    node: Arc<Node>,
    peer: PeerId,
    min_margin: i64,
    done: Option<Done>,
}

impl CatchUpClosure {
    pub(crate) fn new(
        node: Arc<Node>,
        peer: PeerId,
        min_margin: i64,
        done: Option<Done>,
    ) -> Self {
        Self {
            node,
            peer,
            min_margin,
            done,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn min_margin(&self) -> i64 {
        self.min_margin
    }

    pub async fn run(
        mut self,
        result: Result<()>,
    ) {
        let node = self.node.clone();
        node.on_caughtup(self.peer, result, self.done.take()).await;
    }
}
