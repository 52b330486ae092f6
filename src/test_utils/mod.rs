//! Shared helpers for unit tests: peer/options factories, permissive
//! collaborator mocks and in-memory storage fakes.

mod mem_storage;

pub use mem_storage::*;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::async_trait;

use crate::config::NodeOptions;
use crate::config::RaftOptions;
use crate::core::Done;
use crate::membership::Configuration;
use crate::membership::PeerId;
use crate::storage::SnapshotReader;
use crate::storage::SnapshotWriter;
use crate::storage::StateMachine;
use crate::MockCommitManager;
use crate::MockFsmCaller;
use crate::MockReplicatorGroup;
use crate::MockTransport;
use crate::Result;

pub fn test_peer(port: u16) -> PeerId {
    format!("127.0.0.1:{port}:0").parse().expect("should parse")
}

pub fn test_conf(ports: &[u16]) -> Configuration {
    ports.iter().map(|p| test_peer(*p)).collect()
}

/// A `done` whose outcome can be awaited from the test body.
pub fn make_done() -> (Done, oneshot::Receiver<Result<()>>) {
    let (tx, rx) = oneshot::channel();
    let done: Done = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

/// State machine that accepts everything and remembers nothing.
pub struct NoopStateMachine;

#[async_trait]
impl StateMachine for NoopStateMachine {
    async fn on_apply(
        &self,
        _index: i64,
        _data: Bytes,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_snapshot_save(
        &self,
        _writer: &mut dyn SnapshotWriter,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_snapshot_load(
        &self,
        _reader: &dyn SnapshotReader,
    ) -> Result<()> {
        Ok(())
    }
}

/// Options with a short election timeout so role-transition tests finish
/// quickly.
pub fn test_options(conf: Configuration) -> NodeOptions {
    let mut options = NodeOptions::new(Arc::new(NoopStateMachine));
    options.raft = RaftOptions {
        election_timeout_ms: 100,
        snapshot_interval_ms: 0,
        ..Default::default()
    };
    options.conf = conf;
    options
}

/// Commit manager mock accepting any call; completions registered with it
/// are dropped, so use explicit expectations when a test must observe
/// them.
pub fn permissive_commit_manager() -> MockCommitManager {
    let mut commit_manager = MockCommitManager::new();
    commit_manager.expect_init().returning(|_| Ok(()));
    commit_manager
        .expect_reset_pending_index()
        .return_const(());
    commit_manager
        .expect_append_pending_application()
        .returning(|_, done| {
            drop(done);
        });
    commit_manager.expect_set_stable_at_peer().return_const(());
    commit_manager
        .expect_set_last_committed_index()
        .return_const(());
    commit_manager
        .expect_clear_pending_applications()
        .return_const(());
    commit_manager
}

/// State-machine caller mock that runs `on_cleared` completions inline
/// and hands out no-op leader-start closures.
pub fn permissive_fsm_caller() -> MockFsmCaller {
    let mut fsm_caller = MockFsmCaller::new();
    fsm_caller.expect_init().returning(|_| Ok(()));
    fsm_caller.expect_on_committed().return_const(());
    fsm_caller
        .expect_on_cleared()
        .returning(|_, done, error| {
            if let Some(done) = done {
                done(Err(error));
            }
        });
    fsm_caller
        .expect_on_leader_start()
        .returning(|| Box::new(|_| {}));
    fsm_caller.expect_on_leader_stop().return_const(());
    fsm_caller.expect_shutdown().returning(|done| {
        if let Some(done) = done {
            done(Ok(()));
        }
    });
    fsm_caller
}

/// Replicator group mock accepting any call; catch-up waits resolve
/// successfully on a spawned task.
pub fn permissive_replicator_group() -> MockReplicatorGroup {
    let mut replicator_group = MockReplicatorGroup::new();
    replicator_group.expect_init().returning(|_, _| Ok(()));
    replicator_group.expect_add_replicator().returning(|_| Ok(()));
    replicator_group.expect_stop_replicator().return_const(());
    replicator_group.expect_stop_all().return_const(());
    replicator_group
        .expect_wait_caughtup()
        .returning(|_, closure, _| {
            tokio::spawn(closure.run(Ok(())));
        });
    replicator_group
        .expect_last_response_timestamp()
        .returning(|_| Instant::now());
    replicator_group
}

/// Transport mock for nodes that never actually solicit votes.
pub fn unreachable_transport() -> MockTransport {
    let mut transport = MockTransport::new();
    transport.expect_send_request_vote().returning(|peer, _| {
        Err(crate::NetworkError::ConnectError(format!("unreachable peer {peer}")).into())
    });
    transport
}
