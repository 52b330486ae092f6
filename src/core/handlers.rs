//! Inbound RPC handler logic.
//!
//! Handlers enforce the Raft safety rules on inbound messages and always
//! produce a response carrying `current_term` plus a boolean outcome;
//! `tonic::Status` is reserved for malformed input and transport-level
//! rejections, so the embedding RPC service can forward results directly.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::node::NodeInner;
use super::InstallSnapshotDone;
use super::Node;
use super::NodeState;
use crate::membership::Configuration;
use crate::membership::PeerId;
use crate::proto::AppendEntriesRequest;
use crate::proto::AppendEntriesResponse;
use crate::proto::EntryType;
use crate::proto::InstallSnapshotRequest;
use crate::proto::InstallSnapshotResponse;
use crate::proto::RequestVoteRequest;
use crate::proto::RequestVoteResponse;
use crate::storage::LogEntry;
use crate::storage::SnapshotMeta;

impl Node {
    /// Decides whether to grant our vote to a candidate.
    pub async fn handle_request_vote(
        self: &Arc<Self>,
        request: RequestVoteRequest,
    ) -> std::result::Result<RequestVoteResponse, Status> {
        let candidate_id = PeerId::parse(&request.server_id).map_err(|_| {
            warn!(
                "node {} received RequestVote from {}, server_id bad format",
                self.node_id(),
                request.server_id
            );
            Status::invalid_argument("server_id bad format")
        })?;

        let mut inner = self.inner.lock().await;

        let last_log_index = inner.log_manager.last_log_index();
        let last_log_term = inner.last_log_term();
        let log_is_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        if inner.leader_id.is_some() {
            // Still trusting a live leader: reject to tolerate network
            // partitioning instead of being disrupted by it.
            warn!(
                "node {} reject RequestVote from {} in term {} current_term {} \
                 current_leader {:?}",
                self.node_id(),
                request.server_id,
                request.term,
                inner.current_term,
                inner.leader_id
            );
        } else if request.term < inner.current_term {
            info!(
                "node {} ignore RequestVote from {} in term {} current_term {}",
                self.node_id(),
                request.server_id,
                request.term,
                inner.current_term
            );
        } else {
            info!(
                "node {} received RequestVote from {} in term {} current_term {}",
                self.node_id(),
                request.server_id,
                request.term,
                inner.current_term
            );
            if request.term > inner.current_term {
                self.step_down(&mut inner, request.term);
            }

            if log_is_ok && inner.voted_for.is_none() {
                inner.voted_for = Some(candidate_id);
                if let Err(e) = inner.stable_storage.set_votedfor(Some(candidate_id)) {
                    // An unpersisted vote must not reach the wire.
                    error!("node {} persist votedfor failed: {}", self.node_id(), e);
                    inner.voted_for = None;
                }
            }
        }

        Ok(RequestVoteResponse {
            term: inner.current_term,
            granted: request.term == inner.current_term
                && inner.voted_for == Some(candidate_id),
        })
    }

    /// Replication and heartbeat handler. `data_buf` carries the entry
    /// payloads framed in request order.
    pub async fn handle_append_entries(
        self: &Arc<Self>,
        request: AppendEntriesRequest,
        data_buf: Bytes,
    ) -> std::result::Result<AppendEntriesResponse, Status> {
        let server_id = PeerId::parse(&request.server_id).map_err(|_| {
            warn!(
                "node {} received AppendEntries from {}, server_id bad format",
                self.node_id(),
                request.server_id
            );
            Status::invalid_argument("server_id bad format")
        })?;

        let mut inner = self.inner.lock().await;
        let success = self.do_append_entries(&mut inner, server_id, &request, data_buf);

        let response = AppendEntriesResponse {
            term: inner.current_term,
            success,
            last_log_index: inner.log_manager.last_log_index(),
        };
        if success {
            inner
                .commit_manager
                .set_last_committed_index(request.committed_index);
            inner.last_leader_timestamp = Instant::now();
        }
        Ok(response)
    }

    fn do_append_entries(
        self: &Arc<Self>,
        inner: &mut NodeInner,
        server_id: PeerId,
        request: &AppendEntriesRequest,
        mut data_buf: Bytes,
    ) -> bool {
        if request.term < inner.current_term {
            warn!(
                "node {} ignore stale AppendEntries from {} in term {} current_term {}",
                self.node_id(),
                request.server_id,
                request.term,
                inner.current_term
            );
            return false;
        }

        if request.term > inner.current_term || inner.state != NodeState::Follower {
            self.step_down(inner, request.term);
        }

        if inner.leader_id.is_none() {
            inner.leader_id = Some(server_id);
        }

        // Gap: the leader must decrement next_index and retry.
        if request.prev_log_index > inner.log_manager.last_log_index() {
            warn!(
                "node {} reject index_gapped AppendEntries from {} in term {} \
                 prev_log_index {} last_log_index {}",
                self.node_id(),
                request.server_id,
                request.term,
                request.prev_log_index,
                inner.log_manager.last_log_index()
            );
            return false;
        }

        // Entries below first_log_index are covered by a snapshot and
        // trusted.
        if request.prev_log_index >= inner.log_manager.first_log_index() {
            let local_term = inner.log_manager.get_term(request.prev_log_index);
            if local_term != request.prev_log_term {
                warn!(
                    "node {} reject term_unmatched AppendEntries from {} in term {} \
                     prev_log_index {} prev_log_term {} prev_log_term_local {}",
                    self.node_id(),
                    request.server_id,
                    request.term,
                    request.prev_log_index,
                    request.prev_log_term,
                    local_term
                );
                return false;
            }
        }

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut index = request.prev_log_index;
        for meta in &request.entries {
            index += 1;

            // Consume the payload unconditionally so skipped entries keep
            // the frame aligned for the ones that follow.
            let data_len = meta.data_len.unwrap_or(0).max(0) as usize;
            if data_buf.len() < data_len {
                warn!(
                    "node {} AppendEntries payload underrun at index {} ({} < {})",
                    self.node_id(),
                    index,
                    data_buf.len(),
                    data_len
                );
                return false;
            }
            let data = data_buf.split_to(data_len);

            if index < inner.log_manager.first_log_index() {
                // Discarded after a snapshot; tolerate the retried RPC.
                continue;
            }
            if inner.log_manager.last_log_index() >= index {
                if inner.log_manager.get_term(index) == meta.term {
                    // Duplicated RPC delivered the same entry twice.
                    continue;
                }
                let last_index_kept = index - 1;
                warn!(
                    "node {} term {} truncate from {} to {}",
                    self.node_id(),
                    inner.current_term,
                    inner.log_manager.last_log_index(),
                    last_index_kept
                );
                if let Err(e) = inner.log_manager.truncate_suffix(last_index_kept) {
                    error!("node {} truncate_suffix failed: {}", self.node_id(), e);
                    return false;
                }
                inner
                    .log_manager
                    .check_and_set_configuration(&mut inner.conf);
            }

            let entry_type =
                EntryType::try_from(meta.entry_type).unwrap_or(EntryType::Unknown);
            if entry_type == EntryType::Unknown {
                continue;
            }

            let peers = if meta.peers.is_empty() {
                if entry_type == EntryType::AddPeer {
                    warn!(
                        "node {} AddPeer entry without peers at index {}",
                        self.node_id(),
                        index
                    );
                    return false;
                }
                None
            } else {
                let mut parsed = Vec::with_capacity(meta.peers.len());
                for peer in &meta.peers {
                    match PeerId::parse(peer) {
                        Ok(peer) => parsed.push(peer),
                        Err(_) => {
                            warn!(
                                "node {} AppendEntries peers bad format: {}",
                                self.node_id(),
                                peer
                            );
                            return false;
                        }
                    }
                }
                Some(parsed)
            };

            entries.push(LogEntry {
                index,
                term: meta.term,
                entry_type,
                data,
                peers,
            });
        }

        debug!(
            "node {} received {} from {} in term {} prev_index {} prev_term {} \
             count {} current_term {}",
            self.node_id(),
            if entries.is_empty() {
                "Heartbeat"
            } else {
                "AppendEntries"
            },
            request.server_id,
            request.term,
            request.prev_log_index,
            request.prev_log_term,
            entries.len(),
            inner.current_term
        );

        if !entries.is_empty() {
            if let Err(e) = inner.log_manager.append_entries(entries) {
                error!("node {} append entries failed: {}", self.node_id(), e);
                return false;
            }
            inner
                .log_manager
                .check_and_set_configuration(&mut inner.conf);
        }

        true
    }

    /// Snapshot install handler: reserves the load slot, pulls the
    /// snapshot bytes with the node lock released, then hands the loaded
    /// snapshot to the state-machine caller and answers once the user
    /// state machine finished.
    pub async fn handle_install_snapshot(
        self: &Arc<Self>,
        request: InstallSnapshotRequest,
    ) -> std::result::Result<InstallSnapshotResponse, Status> {
        let server_id = PeerId::parse(&request.server_id).map_err(|_| {
            warn!(
                "node {} received InstallSnapshot from {}, server_id bad format",
                self.node_id(),
                request.server_id
            );
            Status::invalid_argument("server_id bad format")
        })?;

        let (snapshot_storage, meta) = {
            let mut inner = self.inner.lock().await;

            if inner.loading_snapshot_meta.is_some() {
                warn!(
                    "node {} received InstallSnapshot from {}, install already running",
                    self.node_id(),
                    request.server_id
                );
                return Err(Status::resource_exhausted("snapshot install already running"));
            }

            if request.term < inner.current_term {
                warn!(
                    "node {} term {} received staled InstallSnapshot term {}",
                    self.node_id(),
                    inner.current_term,
                    request.term
                );
                return Ok(InstallSnapshotResponse {
                    term: inner.current_term,
                    success: false,
                });
            }

            if request.term > inner.current_term || inner.state != NodeState::Follower {
                self.step_down(&mut inner, request.term);
            }

            if inner.leader_id.is_none() {
                inner.leader_id = Some(server_id);
            }

            // Retried install of the snapshot we already hold.
            if request.last_included_log_index == inner.last_snapshot_index
                && request.last_included_log_term == inner.last_snapshot_term
            {
                warn!(
                    "node {} term {} received retry InstallSnapshot from {}",
                    self.node_id(),
                    inner.current_term,
                    request.server_id
                );
                return Ok(InstallSnapshotResponse {
                    term: inner.current_term,
                    success: true,
                });
            }

            // A snapshot never moves history backward nor overlaps a
            // term-matched log tail.
            assert!(request.last_included_log_index > inner.last_snapshot_index);
            assert!(request.last_included_log_index > inner.log_manager.last_log_index());

            let mut last_configuration = Configuration::new();
            for peer in &request.peers {
                let peer = PeerId::parse(peer).map_err(|_| {
                    warn!(
                        "node {} received InstallSnapshot from {}, peers bad format",
                        self.node_id(),
                        request.server_id
                    );
                    Status::invalid_argument("peers bad format")
                })?;
                last_configuration.add_peer(peer);
            }

            let snapshot_storage = match inner.snapshot_storage.clone() {
                Some(storage) => storage,
                None => {
                    warn!(
                        "node {} received InstallSnapshot but snapshot storage not configured",
                        self.node_id()
                    );
                    return Err(Status::failed_precondition(
                        "snapshot storage not configured",
                    ));
                }
            };

            let meta = SnapshotMeta {
                last_included_index: request.last_included_log_index,
                last_included_term: request.last_included_log_term,
                last_configuration,
            };
            inner.loading_snapshot_meta = Some(meta.clone());
            (snapshot_storage, meta)
        };

        // Bulk transfer runs with the lock released.
        let fetch_result = async {
            let mut writer = snapshot_storage.create(meta)?;
            writer.copy(&request.uri).await?;
            writer.save_meta()
        }
        .await;

        if let Err(e) = fetch_result {
            warn!(
                "node {} snapshot fetch failed, uri {}: {}",
                self.node_id(),
                request.uri,
                e
            );
            self.discard_loading_snapshot().await;
            return Err(Status::internal(format!("snapshot fetch failed: {e}")));
        }

        let (tx, rx) = oneshot::channel();
        {
            let inner = self.inner.lock().await;
            inner
                .fsm_caller
                .on_snapshot_load(InstallSnapshotDone::new(self.clone(), tx));
        }

        let load_result = rx
            .await
            .map_err(|_| Status::internal("snapshot load interrupted"))?;
        let term = self.current_term().await;
        match load_result {
            Ok(()) => Ok(InstallSnapshotResponse {
                term,
                success: true,
            }),
            Err(e) => {
                warn!("node {} snapshot load failed: {}", self.node_id(), e);
                Ok(InstallSnapshotResponse {
                    term,
                    success: false,
                })
            }
        }
    }

    /// Vote response from one peer of the current election round.
    pub(crate) async fn handle_request_vote_response(
        self: &Arc<Self>,
        peer_id: PeerId,
        term: i64,
        response: RequestVoteResponse,
    ) {
        let mut inner = self.inner.lock().await;

        if inner.state != NodeState::Candidate {
            warn!(
                "node {} received invalid RequestVoteResponse from {}, not candidate",
                self.node_id(),
                peer_id
            );
            return;
        }
        if term != inner.current_term {
            warn!(
                "node {} received stale RequestVoteResponse from {} term {} current_term {}",
                self.node_id(),
                peer_id,
                term,
                inner.current_term
            );
            return;
        }
        if response.term > inner.current_term {
            warn!(
                "node {} received higher-term RequestVoteResponse from {} term {} expect {}",
                self.node_id(),
                peer_id,
                response.term,
                inner.current_term
            );
            self.step_down(&mut inner, response.term);
            return;
        }

        info!(
            "node {} received RequestVoteResponse from {} term {} granted {}",
            self.node_id(),
            peer_id,
            response.term,
            response.granted
        );
        if response.granted {
            inner.vote_ctx.grant(peer_id);
            if inner.vote_ctx.quorum() {
                self.become_leader(&mut inner);
            }
        }
    }
}
