use std::sync::Arc;

use bytes::Bytes;

use crate::core::NodeBuilder;
use crate::core::NodeState;
use crate::proto::AppendEntriesRequest;
use crate::proto::EntryMeta;
use crate::proto::EntryType;
use crate::proto::InstallSnapshotRequest;
use crate::proto::RequestVoteRequest;
use crate::storage::LogEntry;
use crate::storage::LogManager;
use crate::storage::StableStorage;
use crate::test_utils::permissive_commit_manager;
use crate::test_utils::permissive_fsm_caller;
use crate::test_utils::permissive_replicator_group;
use crate::test_utils::test_conf;
use crate::test_utils::test_options;
use crate::test_utils::test_peer;
use crate::test_utils::unreachable_transport;
use crate::test_utils::MemLogManager;
use crate::test_utils::MemStableStorage;
use crate::Node;

struct Fixture {
    node: Arc<Node>,
    log: Arc<MemLogManager>,
    stable: Arc<MemStableStorage>,
}

/// Follower with seeded log entries and a rehydrated term. Handler tests
/// use an empty configuration so no election timer interferes.
async fn setup_follower(
    group: &str,
    port: u16,
    term: i64,
    entries: Vec<LogEntry>,
) -> Fixture {
    let log = if entries.is_empty() {
        MemLogManager::new()
    } else {
        MemLogManager::with_entries(entries)
    };
    let stable = MemStableStorage::with_term(term, None);
    let node = NodeBuilder::new(group, 0)
        .server_id(test_peer(port))
        .options(test_options(test_conf(&[])))
        .log_manager(log.clone())
        .stable_storage(stable.clone())
        .commit_manager(Arc::new(permissive_commit_manager()))
        .fsm_caller(Arc::new(permissive_fsm_caller()))
        .replicator_group(Arc::new(permissive_replicator_group()))
        .transport(Arc::new(unreachable_transport()))
        .build()
        .expect("should build");
    node.init().await.expect("should init");
    Fixture { node, log, stable }
}

fn vote_request(
    group: &str,
    candidate: u16,
    target: u16,
    term: i64,
    last_log_term: i64,
    last_log_index: i64,
) -> RequestVoteRequest {
    RequestVoteRequest {
        group_id: group.into(),
        server_id: test_peer(candidate).to_string(),
        peer_id: test_peer(target).to_string(),
        term,
        last_log_term,
        last_log_index,
    }
}

fn data_meta(
    term: i64,
    payload: &[u8],
) -> EntryMeta {
    EntryMeta {
        term,
        entry_type: EntryType::Data as i32,
        peers: vec![],
        data_len: Some(payload.len() as i64),
    }
}

/// # Case 1: malformed candidate id is rejected at the transport layer
#[tokio::test]
async fn test_request_vote_bad_server_id() {
    let fixture = setup_follower("rv-bad-id", 7001, 0, vec![]).await;

    let mut request = vote_request("rv-bad-id", 7101, 7001, 1, 0, 0);
    request.server_id = "not-a-peer".into();

    let status = fixture
        .node
        .handle_request_vote(request)
        .await
        .expect_err("bad format must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    fixture.node.shutdown(None).await;
}

/// # Case 2: an up-to-date candidate with a newer term gets our vote,
/// the vote is persisted, and a rival in the same term is refused
#[tokio::test]
async fn test_request_vote_grant_persist_and_refuse_rival() {
    let fixture = setup_follower("rv-grant", 7002, 0, vec![]).await;
    let node = &fixture.node;
    let candidate = test_peer(7102);

    let response = node
        .handle_request_vote(vote_request("rv-grant", 7102, 7002, 5, 0, 0))
        .await
        .expect("should respond");
    assert_eq!(response.term, 5);
    assert!(response.granted);
    assert_eq!(node.current_term().await, 5);
    assert_eq!(
        fixture.stable.get_votedfor().expect("should read"),
        Some(candidate)
    );

    // Retried request from the same candidate: granted again.
    let response = node
        .handle_request_vote(vote_request("rv-grant", 7102, 7002, 5, 0, 0))
        .await
        .expect("should respond");
    assert!(response.granted);

    // A rival in the same term: at most one vote per term.
    let response = node
        .handle_request_vote(vote_request("rv-grant", 7202, 7002, 5, 0, 0))
        .await
        .expect("should respond");
    assert!(!response.granted);
    assert_eq!(
        fixture.stable.get_votedfor().expect("should read"),
        Some(candidate)
    );

    node.shutdown(None).await;
}

/// # Case 3: a stale-term candidate is answered with our term, not
/// granted
#[tokio::test]
async fn test_request_vote_stale_term() {
    let fixture = setup_follower("rv-stale", 7003, 10, vec![]).await;

    let response = fixture
        .node
        .handle_request_vote(vote_request("rv-stale", 7103, 7003, 3, 0, 0))
        .await
        .expect("should respond");
    assert_eq!(response.term, 10);
    assert!(!response.granted);
    assert_eq!(fixture.node.current_term().await, 10);

    fixture.node.shutdown(None).await;
}

/// # Case 4: while we trust a live leader, even a newer-term candidate
/// is rejected and our term is left untouched
#[tokio::test]
async fn test_request_vote_rejected_while_leader_known() {
    let fixture = setup_follower("rv-leader-known", 7004, 0, vec![]).await;
    let node = &fixture.node;
    let leader = test_peer(7104);

    // Heartbeat establishes the leader.
    let heartbeat = AppendEntriesRequest {
        group_id: "rv-leader-known".into(),
        server_id: leader.to_string(),
        peer_id: test_peer(7004).to_string(),
        term: 1,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        committed_index: 0,
    };
    assert!(node
        .handle_append_entries(heartbeat, Bytes::new())
        .await
        .expect("should respond")
        .success);
    assert_eq!(node.leader_id().await, Some(leader));

    let response = node
        .handle_request_vote(vote_request("rv-leader-known", 7204, 7004, 2, 1, 1))
        .await
        .expect("should respond");
    assert!(!response.granted);
    assert_eq!(response.term, 1, "leader check runs before term adoption");
    assert_eq!(node.current_term().await, 1);

    node.shutdown(None).await;
}

/// # Case 5: a candidate with a shorter log is refused even with a newer
/// term (election restriction), though the term itself is adopted
#[tokio::test]
async fn test_request_vote_rejects_shorter_log() {
    let entries = vec![
        LogEntry {
            index: 1,
            term: 1,
            entry_type: EntryType::Data,
            data: Bytes::from_static(b"a"),
            peers: None,
        },
        LogEntry {
            index: 2,
            term: 2,
            entry_type: EntryType::Data,
            data: Bytes::from_static(b"b"),
            peers: None,
        },
    ];
    let fixture = setup_follower("rv-short-log", 7005, 2, entries).await;

    // Candidate's last log term is behind ours.
    let response = fixture
        .node
        .handle_request_vote(vote_request("rv-short-log", 7105, 7005, 3, 1, 5))
        .await
        .expect("should respond");
    assert!(!response.granted);
    assert_eq!(response.term, 3);

    // Same last term but shorter log: refused too.
    let response = fixture
        .node
        .handle_request_vote(vote_request("rv-short-log", 7105, 7005, 4, 2, 1))
        .await
        .expect("should respond");
    assert!(!response.granted);

    // As long, as recent: granted.
    let response = fixture
        .node
        .handle_request_vote(vote_request("rv-short-log", 7105, 7005, 5, 2, 2))
        .await
        .expect("should respond");
    assert!(response.granted);

    fixture.node.shutdown(None).await;
}

/// # Case 6: conflict resolution: an uncommitted suffix with a
/// diverging term is truncated and replaced by the leader's entry
#[tokio::test]
async fn test_append_entries_conflict_truncation() {
    let entries = vec![
        LogEntry {
            index: 1,
            term: 1,
            entry_type: EntryType::Data,
            data: Bytes::from_static(b"x"),
            peers: None,
        },
        LogEntry {
            index: 2,
            term: 1,
            entry_type: EntryType::Data,
            data: Bytes::from_static(b"z"),
            peers: None,
        },
    ];
    let fixture = setup_follower("ae-conflict", 7006, 1, entries).await;
    let node = &fixture.node;

    let request = AppendEntriesRequest {
        group_id: "ae-conflict".into(),
        server_id: test_peer(7106).to_string(),
        peer_id: test_peer(7006).to_string(),
        term: 2,
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![data_meta(2, b"y")],
        committed_index: 1,
    };
    let response = node
        .handle_append_entries(request, Bytes::from_static(b"y"))
        .await
        .expect("should respond");

    assert!(response.success);
    assert_eq!(response.last_log_index, 2);
    assert_eq!(response.term, 2);

    let replaced = fixture.log.entry_at(2).expect("entry must exist");
    assert_eq!(replaced.term, 2);
    assert_eq!(replaced.data, Bytes::from_static(b"y"));

    node.shutdown(None).await;
}

/// # Case 7: delivering the same AppendEntries twice yields the same
/// reply and the same log state
#[tokio::test]
async fn test_append_entries_duplicate_rpc() {
    let fixture = setup_follower("ae-duplicate", 7007, 1, vec![]).await;
    let node = &fixture.node;

    let request = AppendEntriesRequest {
        group_id: "ae-duplicate".into(),
        server_id: test_peer(7107).to_string(),
        peer_id: test_peer(7007).to_string(),
        term: 1,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![data_meta(1, b"aa"), data_meta(1, b"bb")],
        committed_index: 0,
    };

    let first = node
        .handle_append_entries(request.clone(), Bytes::from_static(b"aabb"))
        .await
        .expect("should respond");
    let second = node
        .handle_append_entries(request, Bytes::from_static(b"aabb"))
        .await
        .expect("should respond");

    assert!(first.success && second.success);
    assert_eq!(first.last_log_index, 2);
    assert_eq!(second.last_log_index, 2);
    assert_eq!(fixture.log.entries().len(), 2);
    assert_eq!(
        fixture.log.entry_at(2).expect("entry must exist").data,
        Bytes::from_static(b"bb")
    );

    node.shutdown(None).await;
}

/// # Case 8: a gap between the leader's prev index and our log is
/// rejected with our last index so the leader can back off
#[tokio::test]
async fn test_append_entries_gap_rejected() {
    let fixture = setup_follower("ae-gap", 7008, 1, vec![]).await;

    let request = AppendEntriesRequest {
        group_id: "ae-gap".into(),
        server_id: test_peer(7108).to_string(),
        peer_id: test_peer(7008).to_string(),
        term: 1,
        prev_log_index: 5,
        prev_log_term: 1,
        entries: vec![data_meta(1, b"q")],
        committed_index: 0,
    };
    let response = fixture
        .node
        .handle_append_entries(request, Bytes::from_static(b"q"))
        .await
        .expect("should respond");

    assert!(!response.success);
    assert_eq!(response.last_log_index, 0);
    assert!(fixture.log.entries().is_empty());

    fixture.node.shutdown(None).await;
}

/// # Case 9: prev-term disagreement is rejected without touching the log
#[tokio::test]
async fn test_append_entries_prev_term_mismatch() {
    let entries = vec![LogEntry {
        index: 1,
        term: 1,
        entry_type: EntryType::Data,
        data: Bytes::from_static(b"x"),
        peers: None,
    }];
    let fixture = setup_follower("ae-mismatch", 7009, 1, entries).await;

    let request = AppendEntriesRequest {
        group_id: "ae-mismatch".into(),
        server_id: test_peer(7109).to_string(),
        peer_id: test_peer(7009).to_string(),
        term: 2,
        prev_log_index: 1,
        prev_log_term: 2,
        entries: vec![data_meta(2, b"y")],
        committed_index: 0,
    };
    let response = fixture
        .node
        .handle_append_entries(request, Bytes::from_static(b"y"))
        .await
        .expect("should respond");

    assert!(!response.success);
    assert_eq!(fixture.log.entry_at(1).expect("entry must exist").term, 1);

    fixture.node.shutdown(None).await;
}

/// # Case 10: entries already covered by a snapshot are skipped while the
/// payload frame stays aligned for the entries that follow
#[tokio::test]
async fn test_append_entries_skips_snapshot_covered_prefix() {
    // Log starts at index 3: indexes 1..=2 were compacted away.
    let entries = vec![LogEntry {
        index: 3,
        term: 1,
        entry_type: EntryType::Data,
        data: Bytes::from_static(b"cc"),
        peers: None,
    }];
    let fixture = setup_follower("ae-compacted", 7010, 1, entries).await;

    // Leader retries a range overlapping the compacted prefix and the
    // existing entry, plus one genuinely new entry.
    let request = AppendEntriesRequest {
        group_id: "ae-compacted".into(),
        server_id: test_peer(7110).to_string(),
        peer_id: test_peer(7010).to_string(),
        term: 1,
        prev_log_index: 1,
        prev_log_term: 0,
        entries: vec![
            data_meta(1, b"bb"),
            data_meta(1, b"cc"),
            data_meta(1, b"dd"),
        ],
        committed_index: 0,
    };
    let response = fixture
        .node
        .handle_append_entries(request, Bytes::from_static(b"bbccdd"))
        .await
        .expect("should respond");

    assert!(response.success);
    assert_eq!(response.last_log_index, 4);
    // Index 2 stays compacted, index 3 is untouched, index 4 got the
    // right slice of the payload.
    assert_eq!(fixture.log.first_log_index(), 3);
    assert_eq!(
        fixture.log.entry_at(4).expect("entry must exist").data,
        Bytes::from_static(b"dd")
    );

    fixture.node.shutdown(None).await;
}

/// # Case 11: install snapshot with a stale term completes unsuccessfully
/// with our term; malformed peers are a transport-level rejection
#[tokio::test]
async fn test_install_snapshot_rejections() {
    let fixture = setup_follower("is-reject", 7011, 10, vec![]).await;

    let request = InstallSnapshotRequest {
        group_id: "is-reject".into(),
        server_id: test_peer(7111).to_string(),
        peer_id: test_peer(7011).to_string(),
        term: 3,
        last_included_log_index: 50,
        last_included_log_term: 2,
        peers: vec![test_peer(7111).to_string()],
        uri: "remote://leader/snapshot/50".into(),
    };
    let response = fixture
        .node
        .handle_install_snapshot(request.clone())
        .await
        .expect("stale term completes the rpc");
    assert!(!response.success);
    assert_eq!(response.term, 10);

    let mut bad = request;
    bad.term = 11;
    bad.peers = vec!["???".into()];
    let status = fixture
        .node
        .handle_install_snapshot(bad)
        .await
        .expect_err("bad peers must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    fixture.node.shutdown(None).await;
}

/// # Case 12: a higher-term vote response steps the candidate down
#[tokio::test]
async fn test_vote_response_with_higher_term_steps_down() {
    // Long timeouts keep the vote-retry timer out of the picture.
    let mut options = test_options(test_conf(&[7012, 7112, 7212]));
    options.raft.election_timeout_ms = 60_000;
    let node = NodeBuilder::new("rv-resp-higher", 0)
        .server_id(test_peer(7012))
        .options(options)
        .log_manager(MemLogManager::new())
        .stable_storage(MemStableStorage::new())
        .commit_manager(Arc::new(permissive_commit_manager()))
        .fsm_caller(Arc::new(permissive_fsm_caller()))
        .replicator_group(Arc::new(permissive_replicator_group()))
        .transport(Arc::new(unreachable_transport()))
        .build()
        .expect("should build");
    node.init().await.expect("should init");

    // Force an election round so the node is candidate.
    {
        let mut inner = node.inner.lock().await;
        node.elect_self(&mut inner);
        assert_eq!(inner.state, NodeState::Candidate);
    }
    let term = node.current_term().await;

    node.handle_request_vote_response(
        test_peer(7112),
        term,
        crate::proto::RequestVoteResponse {
            term: term + 3,
            granted: false,
        },
    )
    .await;

    assert_eq!(node.state().await, NodeState::Follower);
    assert_eq!(node.current_term().await, term + 3);

    node.shutdown(None).await;
}
