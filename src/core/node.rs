//! The per-replica node: role state machine, timers, client API and
//! configuration-change orchestration.
//!
//! All mutable state lives in [`NodeInner`] behind one async mutex; every
//! public entry point, RPC handler, timer callback and completion closure
//! locks it before touching anything. Work that can block (disk writes,
//! outbound RPCs, snapshot transfer) is delegated to collaborators that
//! enqueue without blocking, and re-enters the node through closures that
//! take the lock again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use autometrics::autometrics;
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::timer::random_timeout;
use super::timer::OneshotTimer;
use super::vote_context::ConfigurationCtx;
use super::vote_context::VoteContext;
use super::CatchUpClosure;
use super::CommitManager;
use super::CommitManagerOptions;
use super::Done;
use super::FsmCaller;
use super::FsmCallerOptions;
use super::ReplicatorGroup;
use super::ReplicatorGroupOptions;
use super::SaveSnapshotDone;
use crate::constants::MIN_HEARTBEAT_PERIOD_MS;
use crate::constants::MIN_VOTE_TIMEOUT_MS;
use crate::membership::Configuration;
use crate::membership::ConfigurationPair;
use crate::membership::NodeId;
use crate::membership::PeerId;
use crate::network::Transport;
use crate::node_manager::NodeManager;
use crate::proto::EntryType;
use crate::proto::RequestVoteRequest;
use crate::storage::LogEntry;
use crate::storage::LogManager;
use crate::storage::SnapshotMeta;
use crate::storage::SnapshotStorage;
use crate::storage::SnapshotWriter;
use crate::storage::StableStorage;
use crate::config::NodeOptions;
use crate::NodeError;
use crate::API_SLO;
use crate::Result;

/// Role of a replica. `Shutdown` is both the pre-init and the terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Shutdown,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            NodeState::Shutdown => "SHUTDOWN",
            NodeState::Follower => "FOLLOWER",
            NodeState::Candidate => "CANDIDATE",
            NodeState::Leader => "LEADER",
        };
        write!(f, "{s}")
    }
}

/// One replica of a replication group.
///
/// Shared-owned: the registry holds one strong reference, and every
/// outstanding timer or completion closure holds its own for its
/// lifetime.
pub struct Node {
    node_id: NodeId,
    pub(crate) inner: Mutex<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) state: NodeState,
    pub(crate) options: NodeOptions,

    pub(crate) current_term: i64,
    pub(crate) voted_for: Option<PeerId>,
    pub(crate) leader_id: Option<PeerId>,

    pub(crate) conf: ConfigurationPair,
    pub(crate) conf_ctx: ConfigurationCtx,
    pub(crate) vote_ctx: VoteContext,

    pub(crate) last_leader_timestamp: Instant,
    pub(crate) last_snapshot_index: i64,
    pub(crate) last_snapshot_term: i64,
    pub(crate) snapshot_saving: bool,
    pub(crate) loading_snapshot_meta: Option<SnapshotMeta>,

    pub(crate) log_manager: Arc<dyn LogManager>,
    pub(crate) stable_storage: Arc<dyn StableStorage>,
    pub(crate) snapshot_storage: Option<Arc<dyn SnapshotStorage>>,
    pub(crate) commit_manager: Arc<dyn CommitManager>,
    pub(crate) fsm_caller: Arc<dyn FsmCaller>,
    pub(crate) replicator_group: Arc<dyn ReplicatorGroup>,
    pub(crate) transport: Arc<dyn Transport>,

    pub(crate) election_timer: OneshotTimer,
    pub(crate) vote_timer: OneshotTimer,
    pub(crate) stepdown_timer: OneshotTimer,
    pub(crate) snapshot_timer: OneshotTimer,
}

impl NodeInner {
    fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.options.raft.election_timeout_ms)
    }

    /// Term of the last log entry, falling back to the snapshot when the
    /// log is empty or fully compacted.
    pub(crate) fn last_log_term(&self) -> i64 {
        let last_log_index = self.log_manager.last_log_index();
        if last_log_index >= self.log_manager.first_log_index() {
            self.log_manager.get_term(last_log_index)
        } else {
            self.last_snapshot_term
        }
    }

    /// Adopts the pending snapshot meta: advances the snapshot marker,
    /// reconciles the log against it, and installs its configuration.
    ///
    /// Discards the entire log when it is shorter than the snapshot or
    /// when its entry at the snapshot index disagrees with the snapshot
    /// term; otherwise only the covered prefix is dropped.
    fn install_loaded_snapshot(
        &mut self,
        reset_pending: bool,
        node_id: &NodeId,
    ) {
        let meta = match self.loading_snapshot_meta.take() {
            Some(meta) => meta,
            None => {
                error!("node {} snapshot load settled without pending meta", node_id);
                return;
            }
        };

        self.last_snapshot_index = meta.last_included_index;
        self.last_snapshot_term = meta.last_included_term;

        let lm = self.log_manager.clone();
        if lm.last_log_index() < self.last_snapshot_index
            || (lm.first_log_index() <= self.last_snapshot_index
                && lm.get_term(self.last_snapshot_index) != self.last_snapshot_term)
        {
            if lm.first_log_index() <= lm.last_log_index() {
                warn!(
                    "node {} discard the entire log, it is inconsistent with installed snapshot",
                    node_id
                );
            }
            if let Err(e) = lm.truncate_prefix(self.last_snapshot_index + 1) {
                error!("node {} truncate_prefix failed: {}", node_id, e);
            }
            if let Err(e) = lm.truncate_suffix(self.last_snapshot_index) {
                error!("node {} truncate_suffix failed: {}", node_id, e);
            }
        }

        // Entries at or below the snapshot index are covered by it.
        if lm.first_log_index() <= self.last_snapshot_index {
            if let Err(e) = lm.truncate_prefix(self.last_snapshot_index + 1) {
                error!("node {} truncate_prefix failed: {}", node_id, e);
            }
        }

        lm.set_snapshot_configuration(meta.last_included_index, meta.last_configuration.clone());
        lm.check_and_set_configuration(&mut self.conf);

        if reset_pending {
            self.commit_manager
                .reset_pending_index(self.last_snapshot_index + 1);
        }
    }
}

impl Node {
    pub(crate) fn new(
        node_id: NodeId,
        inner: NodeInner,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            inner: Mutex::new(inner),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn group_id(&self) -> &str {
        &self.node_id.group_id
    }

    pub fn server_id(&self) -> PeerId {
        self.node_id.peer_id
    }

    // ---- observability --------------------------------------------------

    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state
    }

    pub async fn current_term(&self) -> i64 {
        self.inner.lock().await.current_term
    }

    pub async fn leader_id(&self) -> Option<PeerId> {
        self.inner.lock().await.leader_id
    }

    pub async fn configuration(&self) -> Configuration {
        self.inner.lock().await.conf.conf.clone()
    }

    pub async fn last_snapshot_index(&self) -> i64 {
        self.inner.lock().await.last_snapshot_index
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.state == NodeState::Leader
    }

    // ---- lifecycle ------------------------------------------------------

    /// Brings the node up: rehydrates stable state, loads the latest
    /// snapshot, wires the commit/FSM collaborators, registers with the
    /// node manager and transitions to follower.
    #[autometrics(objective = API_SLO)]
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Shutdown {
            return Err(NodeError::InvalidArgument("node already initialized".into()).into());
        }

        inner.stable_storage.init()?;
        inner.current_term = inner.stable_storage.get_term()?;
        inner.voted_for = inner.stable_storage.get_votedfor()?;

        if let Some(snapshot_storage) = inner.snapshot_storage.clone() {
            snapshot_storage.init()?;
            if let Some(reader) = snapshot_storage.open()? {
                inner.options.fsm.on_snapshot_load(reader.as_ref()).await?;
                let meta = reader.load_meta()?;
                inner.loading_snapshot_meta = Some(meta);
                // Commit tracking starts below from the snapshot index, so
                // no pending reset is needed here.
                inner.install_loaded_snapshot(false, &self.node_id);
            }
        }

        if inner.log_manager.last_log_index() > 0 {
            let lm = inner.log_manager.clone();
            lm.check_and_set_configuration(&mut inner.conf);
        } else {
            inner.conf.conf = inner.options.conf.clone();
        }

        inner.fsm_caller.init(FsmCallerOptions {
            node: Arc::downgrade(self),
            log_manager: inner.log_manager.clone(),
            fsm: inner.options.fsm.clone(),
            last_applied_index: inner.last_snapshot_index,
        })?;

        inner.commit_manager.init(CommitManagerOptions {
            waiter: inner.fsm_caller.clone(),
            last_committed_index: inner.last_snapshot_index,
            max_pending_size: inner.options.raft.max_pending_applications,
        })?;

        if !NodeManager::global().add(self.clone()) {
            warn!("node {} already exists in node manager", self.node_id);
            return Err(NodeError::Duplicate(self.node_id.clone()).into());
        }

        inner.state = NodeState::Follower;
        info!(
            "node {} init, term: {} last_log_index: {} conf: {}",
            self.node_id,
            inner.current_term,
            inner.log_manager.last_log_index(),
            inner.conf.conf
        );

        if !inner.conf.conf.is_empty() && inner.conf.conf.contains(&self.server_id()) {
            self.arm_election_timer(&mut inner);
        }

        if inner.snapshot_storage.is_some() && inner.options.raft.snapshot_interval_ms > 0 {
            self.arm_snapshot_timer(&mut inner);
        }

        Ok(())
    }

    /// Tears the node down. Idempotent; `done` runs once teardown of the
    /// state-machine caller completes.
    pub async fn shutdown(
        self: &Arc<Self>,
        done: Option<Done>,
    ) {
        // Deregister first so no new RPC can reach this node while it is
        // tearing down.
        NodeManager::global().remove(&self.node_id);

        let mut inner = self.inner.lock().await;
        info!(
            "node {} shutdown, current_term {} state {}",
            self.node_id, inner.current_term, inner.state
        );

        if inner.state == NodeState::Shutdown {
            if let Some(done) = done {
                done(Ok(()));
            }
            return;
        }

        if inner.state != NodeState::Follower {
            let term = inner.current_term;
            self.step_down(&mut inner, term);
        }

        inner.election_timer.cancel();
        inner.snapshot_timer.cancel();
        inner.state = NodeState::Shutdown;

        inner.log_manager.shutdown();
        // Pending applications were cleared during stepdown, so no user
        // closure is stranded in the apply pipeline.
        inner.fsm_caller.shutdown(done);
    }

    // ---- client API -----------------------------------------------------

    /// Proposes an opaque command. Leader-only; the completion fires once
    /// the entry is committed and applied, or with the rejection.
    #[autometrics(objective = API_SLO)]
    pub async fn apply(
        self: &Arc<Self>,
        data: Bytes,
        done: Option<Done>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Shutdown {
            warn!("node {} not inited", self.node_id);
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::ShuttingDown.into());
            return;
        }
        if inner.state != NodeState::Leader {
            warn!("node {} can't apply, not leader", self.node_id);
            let leader_id = inner.leader_id;
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::NotLeader { leader_id }.into());
            return;
        }

        let entry = LogEntry::data_entry(inner.current_term, data);
        self.append_locked(&mut inner, entry, done);
    }

    /// Adds `peer` to the group: starts replication to it, waits until it
    /// has caught up, then proposes the extended configuration.
    #[autometrics(objective = API_SLO)]
    pub async fn add_peer(
        self: &Arc<Self>,
        old_peers: &[PeerId],
        peer: PeerId,
        done: Option<Done>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Leader {
            warn!("node {} can't add_peer, not leader", self.node_id);
            let leader_id = inner.leader_id;
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::NotLeader { leader_id }.into());
            return;
        }
        if !inner.conf_ctx.is_empty() {
            warn!(
                "node {} add_peer must wait for the current configuration change",
                self.node_id
            );
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::ConfChangeInFlight.into());
            return;
        }
        if !inner.conf.conf.equals(old_peers) {
            warn!("node {} add_peer mismatched old_peers", self.node_id);
            inner.fsm_caller.on_cleared(
                0,
                done,
                NodeError::InvalidArgument("old_peers does not match current configuration".into())
                    .into(),
            );
            return;
        }
        if inner.conf.conf.contains(&peer) {
            warn!(
                "node {} add_peer: {} already in configuration",
                self.node_id, peer
            );
            inner.fsm_caller.on_cleared(
                0,
                done,
                NodeError::InvalidArgument(format!("{peer} already in configuration")).into(),
            );
            return;
        }

        info!(
            "node {} add_peer {} to {}, begin caughtup",
            self.node_id, peer, inner.conf.conf
        );

        if let Err(e) = inner.replicator_group.add_replicator(peer) {
            error!("node {} start replicator failed, peer {}: {}", self.node_id, peer, e);
            inner.fsm_caller.on_cleared(0, done, e);
            return;
        }

        let closure = CatchUpClosure::new(
            self.clone(),
            peer,
            inner.options.raft.catchup_margin,
            done,
        );
        let deadline = Instant::now() + inner.election_timeout();
        inner.replicator_group.wait_caughtup(peer, closure, deadline);
    }

    /// Removes `peer` from the group. The reduced configuration is
    /// proposed immediately; the replicator stops once it commits.
    #[autometrics(objective = API_SLO)]
    pub async fn remove_peer(
        self: &Arc<Self>,
        old_peers: &[PeerId],
        peer: PeerId,
        done: Option<Done>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Leader {
            warn!("node {} can't remove_peer, not leader", self.node_id);
            let leader_id = inner.leader_id;
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::NotLeader { leader_id }.into());
            return;
        }
        if !inner.conf_ctx.is_empty() {
            warn!(
                "node {} remove_peer must wait for the current configuration change",
                self.node_id
            );
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::ConfChangeInFlight.into());
            return;
        }
        if !inner.conf.conf.equals(old_peers) {
            warn!("node {} remove_peer mismatched old_peers", self.node_id);
            inner.fsm_caller.on_cleared(
                0,
                done,
                NodeError::InvalidArgument("old_peers does not match current configuration".into())
                    .into(),
            );
            return;
        }
        if !inner.conf.conf.contains(&peer) {
            warn!(
                "node {} remove_peer: {} not in configuration",
                self.node_id, peer
            );
            inner.fsm_caller.on_cleared(
                0,
                done,
                NodeError::InvalidArgument(format!("{peer} not in configuration")).into(),
            );
            return;
        }

        info!(
            "node {} remove_peer {} from {}",
            self.node_id, peer, inner.conf.conf
        );

        let mut new_conf = inner.conf.conf.clone();
        new_conf.remove_peer(&peer);
        let entry = LogEntry::conf_entry(
            inner.current_term,
            EntryType::RemovePeer,
            new_conf.peer_vec(),
        );
        self.append_locked(&mut inner, entry, done);
    }

    /// Operator recovery tool: forces a new configuration without going
    /// through the log. Two shapes are accepted: bootstrapping an empty
    /// node, and overriding a lost-quorum group with a strict minority of
    /// its old peer set.
    #[autometrics(objective = API_SLO)]
    pub async fn set_peer(
        self: &Arc<Self>,
        old_peers: &[PeerId],
        new_peers: &[PeerId],
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Shutdown {
            warn!("node {} not inited", self.node_id);
            return Err(NodeError::ShuttingDown.into());
        }

        // Bootstrap: no configuration yet, install one and restart from
        // term 1.
        if inner.conf.conf.is_empty() && old_peers.is_empty() {
            if new_peers.is_empty() {
                return Err(
                    NodeError::InvalidArgument("bootstrap peer set is empty".into()).into(),
                );
            }
            let new_conf: Configuration = new_peers.into();
            info!("node {} set_peer boot from {}", self.node_id, new_conf);
            inner.conf.conf = new_conf;
            self.step_down(&mut inner, 1);
            return Ok(());
        }

        if inner.state == NodeState::Leader && !inner.conf_ctx.is_empty() {
            warn!(
                "node {} set_peer must wait for the current configuration change",
                self.node_id
            );
            return Err(NodeError::ConfChangeInFlight.into());
        }
        if !inner.conf.conf.equals(old_peers) {
            warn!("node {} set_peer mismatched old_peers", self.node_id);
            return Err(NodeError::InvalidArgument(
                "old_peers does not match current configuration".into(),
            )
            .into());
        }
        // Only a strict minority of the old set may be forced; anything
        // reaching the old quorum must go through the log instead.
        if new_peers.len() >= old_peers.len() / 2 + 1 {
            warn!(
                "node {} set_peer new_peers reaches old_peers' quorum",
                self.node_id
            );
            return Err(NodeError::InvalidArgument(
                "new_peers must be a strict minority of old_peers".into(),
            )
            .into());
        }
        if !inner.conf.conf.contains_all(new_peers) {
            warn!(
                "node {} set_peer old_peers does not contain all new_peers",
                self.node_id
            );
            return Err(NodeError::InvalidArgument(
                "new_peers must be contained in old_peers".into(),
            )
            .into());
        }

        let new_conf: Configuration = new_peers.into();
        info!(
            "node {} set_peer from {} to {}",
            self.node_id, inner.conf.conf, new_conf
        );
        let term = inner.current_term;
        self.step_down(&mut inner, term + 1);
        inner.conf.conf = new_conf;
        Ok(())
    }

    /// Triggers a snapshot of the user state machine.
    #[autometrics(objective = API_SLO)]
    pub async fn snapshot(
        self: &Arc<Self>,
        done: Option<Done>,
    ) {
        let mut inner = self.inner.lock().await;
        self.snapshot_locked(&mut inner, done);
    }

    fn snapshot_locked(
        self: &Arc<Self>,
        inner: &mut NodeInner,
        done: Option<Done>,
    ) {
        if inner.state == NodeState::Shutdown {
            warn!("node {} not inited", self.node_id);
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::ShuttingDown.into());
            return;
        }

        let snapshot_storage = match inner.snapshot_storage.clone() {
            Some(storage) => storage,
            None => {
                warn!(
                    "node {} snapshot unsupported, snapshot_uri not set",
                    self.node_id
                );
                inner.fsm_caller.on_cleared(
                    0,
                    done,
                    NodeError::InvalidArgument("snapshot storage not configured".into()).into(),
                );
                return;
            }
        };

        if inner.loading_snapshot_meta.is_some() {
            warn!("node {} doing snapshot load/install", self.node_id);
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::Busy("snapshot load running").into());
            return;
        }
        if inner.snapshot_saving {
            warn!("node {} doing snapshot save", self.node_id);
            inner
                .fsm_caller
                .on_cleared(0, done, NodeError::Busy("snapshot save running").into());
            return;
        }

        inner.snapshot_saving = true;
        inner
            .fsm_caller
            .on_snapshot_save(SaveSnapshotDone::new(self.clone(), snapshot_storage, done));
    }

    // ---- append path ----------------------------------------------------

    /// Registers the entry with the commit manager under its
    /// configuration-of-record, hands it to the log manager, and records
    /// an in-flight configuration change when one starts.
    pub(crate) fn append_locked(
        self: &Arc<Self>,
        inner: &mut NodeInner,
        entry: LogEntry,
        done: Option<Done>,
    ) {
        let mut old_peers = Vec::new();
        if entry.is_configuration() {
            // Configuration entries compute their commit quorum against
            // the peer set they carry.
            old_peers = inner.conf.conf.peer_vec();
            let new_conf: Configuration = entry
                .peers
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect();
            inner
                .commit_manager
                .append_pending_application(new_conf, done);
        } else {
            inner
                .commit_manager
                .append_pending_application(inner.conf.conf.clone(), done);
        }

        let node = self.clone();
        inner.log_manager.append_entry(
            entry,
            Box::new(move |index, result| match result {
                Ok(()) => {
                    // The leader's own disk counts toward the quorum.
                    tokio::spawn(async move {
                        node.advance_commit_index(None, index).await;
                    });
                }
                Err(e) => {
                    error!("node {} append {} failed: {}", node.node_id, index, e);
                }
            }),
        );

        if inner.log_manager.check_and_set_configuration(&mut inner.conf) {
            inner.conf_ctx.set(old_peers);
        }
    }

    /// Reports a stable index to the commit manager. `None` stands for
    /// the leader's own disk.
    pub async fn advance_commit_index(
        &self,
        peer_id: Option<PeerId>,
        log_index: i64,
    ) {
        let inner = self.inner.lock().await;
        let peer = peer_id.unwrap_or_else(|| self.server_id());
        inner.commit_manager.set_stable_at_peer(log_index, peer);
    }

    // ---- role transitions -----------------------------------------------

    /// Starts (or restarts) an election: bumps the term, votes for self,
    /// persists the vote, and solicits the rest of the peer set.
    pub(crate) fn elect_self(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        info!(
            "node {} term {} start vote and grant vote self",
            self.node_id, inner.current_term
        );
        if inner.state == NodeState::Follower {
            inner.election_timer.cancel();
        }

        inner.state = NodeState::Candidate;
        inner.current_term += 1;
        inner.voted_for = Some(self.server_id());

        self.arm_vote_timer(inner);

        let peers = inner.conf.conf.peer_vec();
        inner.vote_ctx.reset(peers.len());

        let last_log_index = inner.log_manager.last_log_index();
        let last_log_term = inner.last_log_term();
        let mut pending = FuturesUnordered::new();
        for peer in peers {
            if peer == self.server_id() {
                continue;
            }
            let request = RequestVoteRequest {
                group_id: self.group_id().to_string(),
                server_id: self.server_id().to_string(),
                peer_id: peer.to_string(),
                term: inner.current_term,
                last_log_term,
                last_log_index,
            };
            let transport = inner.transport.clone();
            pending.push(async move { (peer, transport.send_request_vote(peer, request).await) });
        }
        let node = self.clone();
        let term = inner.current_term;
        tokio::spawn(async move {
            while let Some((peer, result)) = pending.next().await {
                match result {
                    Ok(response) => {
                        node.handle_request_vote_response(peer, term, response).await;
                    }
                    Err(e) => {
                        warn!("node {} request_vote to {} error: {}", node.node_id, peer, e);
                    }
                }
            }
        });

        inner.vote_ctx.grant(self.server_id());
        if let Err(e) = inner
            .stable_storage
            .set_term_and_votedfor(inner.current_term, Some(self.server_id()))
        {
            // Without a durable vote we must not count ourselves; the vote
            // timer will retry the election.
            error!(
                "node {} persist term and votedfor failed: {}",
                self.node_id, e
            );
            return;
        }
        if inner.vote_ctx.quorum() {
            self.become_leader(inner);
        }
    }

    /// Candidate won its election.
    pub(crate) fn become_leader(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        assert_eq!(inner.state, NodeState::Candidate);
        info!(
            "node {} term {} become leader",
            self.node_id, inner.current_term
        );
        inner.vote_timer.cancel();

        inner.state = NodeState::Leader;
        inner.leader_id = Some(self.server_id());

        inner.log_manager.start_disk_thread();

        let heartbeat_timeout_ms =
            (inner.options.raft.election_timeout_ms / 10).max(MIN_HEARTBEAT_PERIOD_MS);
        if let Err(e) = inner.replicator_group.init(
            self.node_id.clone(),
            ReplicatorGroupOptions {
                node: Arc::downgrade(self),
                term: inner.current_term,
                heartbeat_timeout_ms,
                log_manager: inner.log_manager.clone(),
                commit_manager: inner.commit_manager.clone(),
                snapshot_storage: inner.snapshot_storage.clone(),
            },
        ) {
            error!("node {} replicator group init failed: {}", self.node_id, e);
            let term = inner.current_term;
            self.step_down(inner, term);
            return;
        }

        for peer in inner.conf.conf.peer_vec() {
            if peer == self.server_id() {
                continue;
            }
            if let Err(e) = inner.replicator_group.add_replicator(peer) {
                error!(
                    "node {} add replicator {} failed: {}",
                    self.node_id, peer, e
                );
            }
        }

        inner
            .commit_manager
            .reset_pending_index(inner.log_manager.last_log_index() + 1);

        // Re-assert the current configuration as the first entry of the
        // new leadership; committing it doubles as the leader-start
        // signal.
        let entry = LogEntry::conf_entry(
            inner.current_term,
            EntryType::AddPeer,
            inner.conf.conf.peer_vec(),
        );
        let leader_start = inner.fsm_caller.on_leader_start();
        self.append_locked(inner, entry, Some(leader_start));

        self.arm_stepdown_timer(inner);
    }

    /// Falls back to follower in `term`, releasing all leadership or
    /// candidacy resources.
    pub(crate) fn step_down(
        self: &Arc<Self>,
        inner: &mut NodeInner,
        term: i64,
    ) {
        info!(
            "node {} term {} stepdown from {} new_term {}",
            self.node_id, inner.current_term, inner.state, term
        );

        match inner.state {
            NodeState::Candidate => {
                inner.vote_timer.cancel();
            }
            NodeState::Leader => {
                inner.stepdown_timer.cancel();
                inner.commit_manager.clear_pending_applications();
                inner.log_manager.stop_disk_thread();
                inner.fsm_caller.on_leader_stop();
            }
            _ => {}
        }

        inner.state = NodeState::Follower;
        inner.leader_id = None;
        inner.current_term = term;
        inner.voted_for = None;
        inner.conf_ctx.reset();
        if let Err(e) = inner.stable_storage.set_term_and_votedfor(term, None) {
            error!(
                "node {} persist term and votedfor failed: {}",
                self.node_id, e
            );
        }

        if !inner.conf.conf.is_empty() && inner.conf.conf.contains(&self.server_id()) {
            self.arm_election_timer(inner);
        }

        // Also stops any staging replicator left over from an aborted
        // add_peer.
        inner.replicator_group.stop_all();
    }

    /// Adopts `new_term` if it is ahead of ours (replicator path on a
    /// higher-term response).
    pub async fn increase_term_to(
        self: &Arc<Self>,
        new_term: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if new_term <= inner.current_term {
            return Err(NodeError::InvalidArgument(format!(
                "term {} not greater than current {}",
                new_term, inner.current_term
            ))
            .into());
        }
        self.step_down(&mut inner, new_term);
        Ok(())
    }

    // ---- timers ---------------------------------------------------------

    fn arm_election_timer(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        let node = self.clone();
        let delay = random_timeout(inner.options.raft.election_timeout_ms);
        inner.election_timer.schedule(delay, async move {
            node.handle_election_timeout().await;
        });
    }

    fn arm_vote_timer(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        let node = self.clone();
        let base = (inner.options.raft.election_timeout_ms / 10).max(MIN_VOTE_TIMEOUT_MS);
        inner.vote_timer.schedule(random_timeout(base), async move {
            node.handle_vote_timeout().await;
        });
    }

    fn arm_stepdown_timer(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        let node = self.clone();
        let delay = inner.election_timeout();
        inner.stepdown_timer.schedule(delay, async move {
            node.handle_stepdown_timeout().await;
        });
    }

    fn arm_snapshot_timer(
        self: &Arc<Self>,
        inner: &mut NodeInner,
    ) {
        let node = self.clone();
        let delay = Duration::from_millis(inner.options.raft.snapshot_interval_ms);
        inner.snapshot_timer.schedule(delay, async move {
            node.handle_snapshot_timeout().await;
        });
    }

    /// Follower election timeout: start an election unless the leader was
    /// heard from recently.
    pub(crate) async fn handle_election_timeout(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Follower {
            return;
        }
        if inner.last_leader_timestamp.elapsed() < inner.election_timeout() {
            self.arm_election_timer(&mut inner);
            return;
        }

        info!(
            "node {} term {} start elect",
            self.node_id, inner.current_term
        );
        self.elect_self(&mut inner);
    }

    /// Candidate vote retry: restart the election from scratch.
    pub(crate) async fn handle_vote_timeout(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Candidate {
            info!(
                "node {} term {} retry elect",
                self.node_id, inner.current_term
            );
            self.elect_self(&mut inner);
        }
    }

    /// Leader dead-follower check: step down when a majority has been
    /// silent for a full election timeout.
    pub(crate) async fn handle_stepdown_timeout(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state != NodeState::Leader {
            return;
        }

        let now = Instant::now();
        let election_timeout = inner.election_timeout();
        let dead_count = inner
            .conf
            .conf
            .peers()
            .filter(|peer| {
                **peer != self.server_id()
                    && now.duration_since(inner.replicator_group.last_response_timestamp(**peer))
                        > election_timeout
            })
            .count();

        if dead_count < inner.conf.conf.quorum() {
            self.arm_stepdown_timer(&mut inner);
        } else {
            info!(
                "node {} term {} stepdown when quorum node dead",
                self.node_id, inner.current_term
            );
            let term = inner.current_term;
            self.step_down(&mut inner, term);
        }
    }

    /// Periodic snapshot trigger.
    pub(crate) async fn handle_snapshot_timeout(self: Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.state == NodeState::Shutdown {
            return;
        }
        self.snapshot_locked(&mut inner, None);
        self.arm_snapshot_timer(&mut inner);
    }

    // ---- configuration change completions -------------------------------

    /// Catch-up wait settled for `peer` (add_peer flow). Success proposes
    /// the extended configuration; a transient timeout with recent
    /// follower activity retries; anything else aborts.
    pub async fn on_caughtup(
        self: &Arc<Self>,
        peer: PeerId,
        result: Result<()>,
        done: Option<Done>,
    ) {
        let mut inner = self.inner.lock().await;

        match result {
            Ok(()) => {
                if inner.state != NodeState::Leader {
                    warn!(
                        "node {} caughtup {} but leadership was lost",
                        self.node_id, peer
                    );
                    let leader_id = inner.leader_id;
                    inner.fsm_caller.on_cleared(
                        0,
                        done,
                        NodeError::NotLeader { leader_id }.into(),
                    );
                    inner.conf_ctx.reset();
                    inner.replicator_group.stop_replicator(peer);
                    return;
                }

                info!(
                    "node {} add_peer {} to {}, caughtup success, then append add_peer entry",
                    self.node_id, peer, inner.conf.conf
                );
                let mut new_conf = inner.conf.conf.clone();
                new_conf.add_peer(peer);
                let entry = LogEntry::conf_entry(
                    inner.current_term,
                    EntryType::AddPeer,
                    new_conf.peer_vec(),
                );
                self.append_locked(&mut inner, entry, done);
            }
            Err(e) => {
                let is_timeout = matches!(
                    e,
                    crate::Error::Node(NodeError::CatchUpTimeout(_))
                );
                if is_timeout
                    && inner
                        .replicator_group
                        .last_response_timestamp(peer)
                        .elapsed()
                        <= inner.election_timeout()
                {
                    info!("node {} catching up {}", self.node_id, peer);
                    let closure = CatchUpClosure::new(
                        self.clone(),
                        peer,
                        inner.options.raft.catchup_margin,
                        done,
                    );
                    let deadline = Instant::now() + inner.election_timeout();
                    inner.replicator_group.wait_caughtup(peer, closure, deadline);
                    return;
                }

                info!(
                    "node {} add_peer {} to {}, caughtup failed: {}",
                    self.node_id, peer, inner.conf.conf, e
                );
                inner.fsm_caller.on_cleared(0, done, e);
                inner.conf_ctx.reset();
                // Stop the staging replicator after user completion so the
                // group can release its wait registration first.
                inner.replicator_group.stop_replicator(peer);
            }
        }
    }

    /// A configuration entry was applied by the state machine caller.
    pub async fn on_configuration_change_done(
        self: &Arc<Self>,
        entry_type: EntryType,
        new_peers: Vec<PeerId>,
    ) {
        let mut inner = self.inner.lock().await;

        match entry_type {
            EntryType::AddPeer => {
                info!(
                    "node {} add_peer to {} success",
                    self.node_id, inner.conf.conf
                );
            }
            EntryType::RemovePeer => {
                info!(
                    "node {} remove_peer to {} success",
                    self.node_id, inner.conf.conf
                );
                if !inner.conf.conf.contains(&self.server_id()) {
                    // Removed ourselves: leave the group entirely.
                    inner.conf.conf.reset();
                    let term = inner.current_term;
                    self.step_down(&mut inner, term);
                } else {
                    let mut removed: Configuration = inner.conf_ctx.peers().into();
                    for peer in &new_peers {
                        removed.remove_peer(peer);
                    }
                    for peer in removed.peer_vec() {
                        inner.replicator_group.stop_replicator(peer);
                    }
                }
            }
            _ => {
                error!(
                    "node {} unexpected configuration entry type {:?}",
                    self.node_id, entry_type
                );
            }
        }
        inner.conf_ctx.reset();
    }

    // ---- snapshot completions -------------------------------------------

    /// A snapshot save settled. Rejects saves superseded by an installed
    /// snapshot, otherwise advances the snapshot marker and compacts the
    /// covered log prefix.
    pub(crate) async fn on_snapshot_save_done(
        &self,
        last_included_index: i64,
        writer: &mut dyn SnapshotWriter,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if last_included_index <= inner.last_snapshot_index {
            warn!(
                "node {} discard saved snapshot, a newer snapshot exists: \
                 last_included_index {} last_snapshot_index {}",
                self.node_id, last_included_index, inner.last_snapshot_index
            );
            let error = NodeError::Stale {
                index: last_included_index,
                snapshot_index: inner.last_snapshot_index,
            };
            writer.set_error(
                NodeError::Stale {
                    index: last_included_index,
                    snapshot_index: inner.last_snapshot_index,
                }
                .into(),
            );
            inner.snapshot_saving = false;
            return Err(error.into());
        }

        assert!(last_included_index >= inner.log_manager.first_log_index());
        assert!(last_included_index <= inner.log_manager.last_log_index());

        inner.last_snapshot_index = last_included_index;
        inner.last_snapshot_term = inner.log_manager.get_term(last_included_index);

        let pair = inner.log_manager.get_configuration(last_included_index);
        if pair.index != 0 {
            inner
                .log_manager
                .set_snapshot_configuration(pair.index, pair.conf);
        }

        // Entries the snapshot covers are no longer needed.
        if inner.log_manager.first_log_index() <= last_included_index {
            if let Err(e) = inner.log_manager.truncate_prefix(last_included_index + 1) {
                error!("node {} truncate_prefix failed: {}", self.node_id, e);
            }
        }

        let lm = inner.log_manager.clone();
        lm.check_and_set_configuration(&mut inner.conf);

        let result = writer.save_meta();
        inner.snapshot_saving = false;
        result
    }

    /// The user state machine failed to produce a snapshot; release the
    /// save slot.
    pub(crate) async fn on_snapshot_save_aborted(&self) {
        let mut inner = self.inner.lock().await;
        inner.snapshot_saving = false;
    }

    /// An installed snapshot finished loading into the user state machine.
    pub(crate) async fn on_snapshot_load_done(&self) {
        let mut inner = self.inner.lock().await;
        inner.install_loaded_snapshot(true, &self.node_id);
    }

    /// A snapshot install failed after reserving the load slot.
    pub(crate) async fn discard_loading_snapshot(&self) {
        let mut inner = self.inner.lock().await;
        inner.loading_snapshot_meta = None;
    }
}

impl fmt::Debug for Node {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Node").field("node_id", &self.node_id).finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        info!("node {} dropped", self.node_id);
    }
}
