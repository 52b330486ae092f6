//! Node assembly.
//!
//! The builder resolves the node's storage collaborators from the URIs in
//! [`NodeOptions`] through the driver registry, unless instances are
//! injected directly (tests, embedders with custom storage). The commit
//! manager, state-machine caller, replicator group and transport have no
//! URI form and must always be injected.

use std::sync::Arc;

use tokio::time::Instant;

use super::node::NodeInner;
use super::node::NodeState;
use super::timer::OneshotTimer;
use super::vote_context::ConfigurationCtx;
use super::vote_context::VoteContext;
use super::CommitManager;
use super::FsmCaller;
use super::Node;
use super::ReplicatorGroup;
use crate::config::NodeOptions;
use crate::membership::GroupId;
use crate::membership::NodeId;
use crate::membership::PeerId;
use crate::network::Transport;
use crate::node_manager::NodeManager;
use crate::storage::find_driver;
use crate::storage::LogManager;
use crate::storage::SnapshotStorage;
use crate::storage::StableStorage;
use crate::NodeError;
use crate::Result;

pub struct NodeBuilder {
    group_id: GroupId,
    replica_idx: u32,
    server_id: Option<PeerId>,
    options: Option<NodeOptions>,

    log_manager: Option<Arc<dyn LogManager>>,
    stable_storage: Option<Arc<dyn StableStorage>>,
    snapshot_storage: Option<Arc<dyn SnapshotStorage>>,
    commit_manager: Option<Arc<dyn CommitManager>>,
    fsm_caller: Option<Arc<dyn FsmCaller>>,
    replicator_group: Option<Arc<dyn ReplicatorGroup>>,
    transport: Option<Arc<dyn Transport>>,
}

impl NodeBuilder {
    /// Starts building the replica `replica_idx` of `group_id`. The
    /// endpoint defaults to the initialized [`NodeManager`] address.
    pub fn new(
        group_id: impl Into<GroupId>,
        replica_idx: u32,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            replica_idx,
            server_id: None,
            options: None,
            log_manager: None,
            stable_storage: None,
            snapshot_storage: None,
            commit_manager: None,
            fsm_caller: None,
            replicator_group: None,
            transport: None,
        }
    }

    /// Overrides the server endpoint instead of reading it from the node
    /// manager.
    pub fn server_id(
        mut self,
        server_id: PeerId,
    ) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn options(
        mut self,
        options: NodeOptions,
    ) -> Self {
        self.options = Some(options);
        self
    }

    pub fn log_manager(
        mut self,
        log_manager: Arc<dyn LogManager>,
    ) -> Self {
        self.log_manager = Some(log_manager);
        self
    }

    pub fn stable_storage(
        mut self,
        stable_storage: Arc<dyn StableStorage>,
    ) -> Self {
        self.stable_storage = Some(stable_storage);
        self
    }

    pub fn snapshot_storage(
        mut self,
        snapshot_storage: Arc<dyn SnapshotStorage>,
    ) -> Self {
        self.snapshot_storage = Some(snapshot_storage);
        self
    }

    pub fn commit_manager(
        mut self,
        commit_manager: Arc<dyn CommitManager>,
    ) -> Self {
        self.commit_manager = Some(commit_manager);
        self
    }

    pub fn fsm_caller(
        mut self,
        fsm_caller: Arc<dyn FsmCaller>,
    ) -> Self {
        self.fsm_caller = Some(fsm_caller);
        self
    }

    pub fn replicator_group(
        mut self,
        replicator_group: Arc<dyn ReplicatorGroup>,
    ) -> Self {
        self.replicator_group = Some(replicator_group);
        self
    }

    pub fn transport(
        mut self,
        transport: Arc<dyn Transport>,
    ) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Resolves storages and assembles the node in its pre-init
    /// `Shutdown` state. Call [`Node::init`] afterwards.
    pub fn build(self) -> Result<Arc<Node>> {
        let options = self
            .options
            .ok_or_else(|| NodeError::InvalidArgument("node options not set".into()))?;
        options.raft.validate()?;

        let server_id = match self.server_id {
            Some(server_id) => server_id,
            None => {
                let addr = NodeManager::global()
                    .address()
                    .ok_or(NodeError::ShuttingDown)?;
                PeerId::new(addr, self.replica_idx)
            }
        };

        let log_manager = match self.log_manager {
            Some(log_manager) => log_manager,
            None => find_driver(&options.log_uri)?.create_log_manager(&options.log_uri)?,
        };
        let stable_storage = match self.stable_storage {
            Some(stable_storage) => stable_storage,
            None => find_driver(&options.stable_uri)?.create_stable_storage(&options.stable_uri)?,
        };
        let snapshot_storage = match self.snapshot_storage {
            Some(snapshot_storage) => Some(snapshot_storage),
            None if options.snapshot_uri.is_empty() => None,
            None => Some(
                find_driver(&options.snapshot_uri)?
                    .create_snapshot_storage(&options.snapshot_uri)?,
            ),
        };

        let commit_manager = self
            .commit_manager
            .ok_or_else(|| NodeError::InvalidArgument("commit manager not set".into()))?;
        let fsm_caller = self
            .fsm_caller
            .ok_or_else(|| NodeError::InvalidArgument("fsm caller not set".into()))?;
        let replicator_group = self
            .replicator_group
            .ok_or_else(|| NodeError::InvalidArgument("replicator group not set".into()))?;
        let transport = self
            .transport
            .ok_or_else(|| NodeError::InvalidArgument("transport not set".into()))?;

        let node_id = NodeId::new(self.group_id, server_id);
        let inner = NodeInner {
            state: NodeState::Shutdown,
            options,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            conf: Default::default(),
            conf_ctx: ConfigurationCtx::default(),
            vote_ctx: VoteContext::default(),
            last_leader_timestamp: Instant::now(),
            last_snapshot_index: 0,
            last_snapshot_term: 0,
            snapshot_saving: false,
            loading_snapshot_meta: None,
            log_manager,
            stable_storage,
            snapshot_storage,
            commit_manager,
            fsm_caller,
            replicator_group,
            transport,
            election_timer: OneshotTimer::new(),
            vote_timer: OneshotTimer::new(),
            stepdown_timer: OneshotTimer::new(),
            snapshot_timer: OneshotTimer::new(),
        };

        Ok(Node::new(node_id, inner))
    }
}
