//! Wire messages of the replica RPC service.
//!
//! Three request/response pairs: `RequestVote`, `AppendEntries` and
//! `InstallSnapshot`. The message types are hand-rolled `prost` structs so
//! the crate builds without a protoc toolchain; the field tags are the wire
//! contract and must not be reassigned.
//!
//! `AppendEntries` ships entry payloads out-of-band: the request carries
//! one [`EntryMeta`] per entry, and a single byte buffer holds the payloads
//! framed in order, `data_len` bytes per `Data` entry.

/// Kind of a replicated log entry. Also used on the wire in [`EntryMeta`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum EntryType {
    Unknown = 0,
    NoOp = 1,
    Data = 2,
    AddPeer = 3,
    RemovePeer = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EntryMeta {
    #[prost(int64, tag = "1")]
    pub term: i64,

    #[prost(enumeration = "EntryType", tag = "2")]
    pub entry_type: i32,

    /// Peer set carried by `AddPeer`/`RemovePeer` entries.
    #[prost(string, repeated, tag = "3")]
    pub peers: Vec<String>,

    /// Payload length in the out-of-band buffer; set for `Data` entries.
    #[prost(int64, optional, tag = "4")]
    pub data_len: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestVoteRequest {
    #[prost(string, tag = "1")]
    pub group_id: String,

    /// Candidate id in `ip:port:idx` form.
    #[prost(string, tag = "2")]
    pub server_id: String,

    /// Target peer id; lets the receiving server route to the right replica.
    #[prost(string, tag = "3")]
    pub peer_id: String,

    #[prost(int64, tag = "4")]
    pub term: i64,

    #[prost(int64, tag = "5")]
    pub last_log_term: i64,

    #[prost(int64, tag = "6")]
    pub last_log_index: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestVoteResponse {
    #[prost(int64, tag = "1")]
    pub term: i64,

    #[prost(bool, tag = "2")]
    pub granted: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendEntriesRequest {
    #[prost(string, tag = "1")]
    pub group_id: String,

    /// Leader id in `ip:port:idx` form.
    #[prost(string, tag = "2")]
    pub server_id: String,

    #[prost(string, tag = "3")]
    pub peer_id: String,

    #[prost(int64, tag = "4")]
    pub term: i64,

    #[prost(int64, tag = "5")]
    pub prev_log_index: i64,

    #[prost(int64, tag = "6")]
    pub prev_log_term: i64,

    #[prost(message, repeated, tag = "7")]
    pub entries: Vec<EntryMeta>,

    #[prost(int64, tag = "8")]
    pub committed_index: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AppendEntriesResponse {
    #[prost(int64, tag = "1")]
    pub term: i64,

    #[prost(bool, tag = "2")]
    pub success: bool,

    #[prost(int64, tag = "3")]
    pub last_log_index: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InstallSnapshotRequest {
    #[prost(string, tag = "1")]
    pub group_id: String,

    /// Leader id in `ip:port:idx` form.
    #[prost(string, tag = "2")]
    pub server_id: String,

    #[prost(string, tag = "3")]
    pub peer_id: String,

    #[prost(int64, tag = "4")]
    pub term: i64,

    #[prost(int64, tag = "5")]
    pub last_included_log_index: i64,

    #[prost(int64, tag = "6")]
    pub last_included_log_term: i64,

    /// Peer set at the snapshot's last included index.
    #[prost(string, repeated, tag = "7")]
    pub peers: Vec<String>,

    /// Location the follower pulls the snapshot bytes from.
    #[prost(string, tag = "8")]
    pub uri: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InstallSnapshotResponse {
    #[prost(int64, tag = "1")]
    pub term: i64,

    #[prost(bool, tag = "2")]
    pub success: bool,
}
