//! In-memory log manager and stable storage used by node tests that need
//! real log semantics (conflict truncation, snapshot compaction) instead
//! of mock expectations.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::membership::Configuration;
use crate::membership::ConfigurationPair;
use crate::membership::PeerId;
use crate::storage::AppendClosure;
use crate::storage::LogEntry;
use crate::storage::LogManager;
use crate::storage::StableStorage;
use crate::Result;

#[derive(Default)]
struct MemLogState {
    /// Contiguous tail of the log: `entries[i].index == first_index + i`.
    entries: Vec<LogEntry>,
    first_index: i64,
    snapshot_conf: Option<(i64, Configuration)>,
}

pub struct MemLogManager {
    state: Mutex<MemLogState>,
}

impl MemLogManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemLogState {
                entries: Vec::new(),
                first_index: 1,
                snapshot_conf: None,
            }),
        })
    }

    /// Seeds the log with `entries` (test setup).
    pub fn with_entries(entries: Vec<LogEntry>) -> Arc<Self> {
        let first_index = entries.first().map(|e| e.index).unwrap_or(1);
        Arc::new(Self {
            state: Mutex::new(MemLogState {
                entries,
                first_index,
                snapshot_conf: None,
            }),
        })
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().entries.clone()
    }

    pub fn entry_at(
        &self,
        index: i64,
    ) -> Option<LogEntry> {
        let state = self.state.lock();
        let offset = index.checked_sub(state.first_index)?;
        if offset < 0 {
            return None;
        }
        state.entries.get(offset as usize).cloned()
    }

    fn latest_conf_at(
        state: &MemLogState,
        index: i64,
    ) -> ConfigurationPair {
        let from_log = state
            .entries
            .iter()
            .rev()
            .filter(|e| e.index <= index && e.is_configuration())
            .find_map(|e| {
                e.peers.as_ref().map(|peers| ConfigurationPair {
                    index: e.index,
                    conf: peers.iter().copied().collect(),
                })
            });
        match (from_log, &state.snapshot_conf) {
            (Some(pair), Some((snap_index, snap_conf))) if *snap_index > pair.index => {
                ConfigurationPair {
                    index: *snap_index,
                    conf: snap_conf.clone(),
                }
            }
            (Some(pair), _) => pair,
            (None, Some((snap_index, snap_conf))) => ConfigurationPair {
                index: *snap_index,
                conf: snap_conf.clone(),
            },
            (None, None) => ConfigurationPair::default(),
        }
    }
}

impl LogManager for MemLogManager {
    fn first_log_index(&self) -> i64 {
        self.state.lock().first_index
    }

    fn last_log_index(&self) -> i64 {
        let state = self.state.lock();
        state.first_index + state.entries.len() as i64 - 1
    }

    fn get_term(
        &self,
        index: i64,
    ) -> i64 {
        let state = self.state.lock();
        let offset = index - state.first_index;
        if offset < 0 {
            return 0;
        }
        state
            .entries
            .get(offset as usize)
            .map(|e| e.term)
            .unwrap_or(0)
    }

    fn append_entry(
        &self,
        mut entry: LogEntry,
        done: AppendClosure,
    ) -> i64 {
        let index = {
            let mut state = self.state.lock();
            let index = state.first_index + state.entries.len() as i64;
            entry.index = index;
            state.entries.push(entry);
            index
        };
        done(index, Ok(()));
        index
    }

    fn append_entries(
        &self,
        entries: Vec<LogEntry>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for entry in entries {
            let expected = state.first_index + state.entries.len() as i64;
            assert_eq!(entry.index, expected, "non-contiguous append");
            state.entries.push(entry);
        }
        Ok(())
    }

    fn truncate_prefix(
        &self,
        first_index_kept: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let drop_count = (first_index_kept - state.first_index).clamp(0, state.entries.len() as i64);
        state.entries.drain(..drop_count as usize);
        state.first_index = state.first_index.max(first_index_kept);
        Ok(())
    }

    fn truncate_suffix(
        &self,
        last_index_kept: i64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let keep = (last_index_kept - state.first_index + 1).max(0) as usize;
        state.entries.truncate(keep);
        Ok(())
    }

    fn check_and_set_configuration(
        &self,
        current: &mut ConfigurationPair,
    ) -> bool {
        let state = self.state.lock();
        let last = state.first_index + state.entries.len() as i64 - 1;
        let pair = Self::latest_conf_at(&state, last);
        if pair.index != 0 && pair.index != current.index {
            *current = pair;
            return true;
        }
        false
    }

    fn get_configuration(
        &self,
        index: i64,
    ) -> ConfigurationPair {
        let state = self.state.lock();
        Self::latest_conf_at(&state, index)
    }

    fn set_snapshot_configuration(
        &self,
        index: i64,
        conf: Configuration,
    ) {
        self.state.lock().snapshot_conf = Some((index, conf));
    }

    fn start_disk_thread(&self) {}

    fn stop_disk_thread(&self) {}

    fn shutdown(&self) {}
}

pub struct MemStableStorage {
    state: Mutex<(i64, Option<PeerId>)>,
}

impl MemStableStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((0, None)),
        })
    }

    pub fn with_term(
        term: i64,
        voted_for: Option<PeerId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((term, voted_for)),
        })
    }
}

impl StableStorage for MemStableStorage {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn get_term(&self) -> Result<i64> {
        Ok(self.state.lock().0)
    }

    fn get_votedfor(&self) -> Result<Option<PeerId>> {
        Ok(self.state.lock().1)
    }

    fn set_term_and_votedfor(
        &self,
        term: i64,
        peer: Option<PeerId>,
    ) -> Result<()> {
        *self.state.lock() = (term, peer);
        Ok(())
    }

    fn set_votedfor(
        &self,
        peer: Option<PeerId>,
    ) -> Result<()> {
        self.state.lock().1 = peer;
        Ok(())
    }
}
