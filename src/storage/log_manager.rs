//! Log manager contract: the collaborator that owns the durable ordered
//! entry sequence, index assignment, term lookup and truncation.

#[cfg(test)]
use mockall::automock;

use bytes::Bytes;

use crate::membership::Configuration;
use crate::membership::ConfigurationPair;
use crate::membership::PeerId;
use crate::proto::EntryType;
use crate::Result;

/// A single record in the replicated log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogEntry {
    /// Assigned by the log manager; `0` until appended on the leader.
    pub index: i64,
    pub term: i64,
    pub entry_type: EntryType,
    /// Opaque payload of `Data` entries.
    pub data: Bytes,
    /// Peer set carried by `AddPeer`/`RemovePeer` entries.
    pub peers: Option<Vec<PeerId>>,
}

impl LogEntry {
    pub fn data_entry(
        term: i64,
        data: Bytes,
    ) -> Self {
        Self {
            term,
            entry_type: EntryType::Data,
            data,
            ..Default::default()
        }
    }

    pub fn conf_entry(
        term: i64,
        entry_type: EntryType,
        peers: Vec<PeerId>,
    ) -> Self {
        debug_assert!(matches!(
            entry_type,
            EntryType::AddPeer | EntryType::RemovePeer
        ));
        Self {
            term,
            entry_type,
            peers: Some(peers),
            ..Default::default()
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self.entry_type, EntryType::AddPeer | EntryType::RemovePeer)
    }
}

/// Invoked once the entry handed to [`LogManager::append_entry`] is durable
/// locally (or failed), with the index the log manager assigned to it.
pub type AppendClosure = Box<dyn FnOnce(i64, Result<()>) + Send + 'static>;

/// Contract of the log manager collaborator.
///
/// All methods are non-blocking from the node's perspective: writes are
/// enqueued to the manager's own disk thread, so the node may call them
/// while holding its mutex. Index assignment is monotone, and `get_term`
/// answers for any index still covered by the log.
#[cfg_attr(test, automock)]
pub trait LogManager: Send + Sync + 'static {
    /// First index still held by the log. `last_log_index() + 1` when the
    /// log is empty.
    fn first_log_index(&self) -> i64;

    fn last_log_index(&self) -> i64;

    /// Term of the entry at `index`; `0` when the log holds no such entry.
    fn get_term(
        &self,
        index: i64,
    ) -> i64;

    /// Leader-side append: assigns the next index, enqueues the write, and
    /// runs `done` when the entry is durable. Returns the assigned index.
    fn append_entry(
        &self,
        entry: LogEntry,
        done: AppendClosure,
    ) -> i64;

    /// Follower-side batch append of entries that already carry indexes.
    fn append_entries(
        &self,
        entries: Vec<LogEntry>,
    ) -> Result<()>;

    /// Drops every entry with index < `first_index_kept` (snapshot-driven
    /// prefix compaction).
    fn truncate_prefix(
        &self,
        first_index_kept: i64,
    ) -> Result<()>;

    /// Drops every entry with index > `last_index_kept` (conflict
    /// resolution).
    fn truncate_suffix(
        &self,
        last_index_kept: i64,
    ) -> Result<()>;

    /// Refreshes `current` to the configuration-of-record for the present
    /// log contents. Returns true iff the active configuration changed.
    fn check_and_set_configuration(
        &self,
        current: &mut ConfigurationPair,
    ) -> bool;

    /// Configuration in effect at or before `index`; `index == 0` in the
    /// returned pair means none is known.
    fn get_configuration(
        &self,
        index: i64,
    ) -> ConfigurationPair;

    /// Installs the configuration recovered from a snapshot.
    fn set_snapshot_configuration(
        &self,
        index: i64,
        conf: Configuration,
    );

    /// Leader-only disk batching thread.
    fn start_disk_thread(&self);
    fn stop_disk_thread(&self);

    fn shutdown(&self);
}
