//! Node configuration.
//!
//! [`RaftOptions`] carries the tunable consensus parameters with defaults
//! in code, overridable from a config file and from `REPLICORE__`-prefixed
//! environment variables (highest priority). [`NodeOptions`] bundles them
//! with the per-replica wiring: storage URIs, the bootstrap peer set and
//! the user state machine.

use std::fmt::Debug;
use std::sync::Arc;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;

use crate::membership::Configuration;
use crate::storage::StateMachine;
use crate::Result;

/// Tunable consensus parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RaftOptions {
    /// Base election timeout in milliseconds. All election-related timers
    /// derive from it with randomized jitter.
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Interval between periodic snapshots in milliseconds; `0` disables
    /// the snapshot timer.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// A new peer counts as caught up once its match index is within this
    /// many entries of the leader's last log index.
    #[serde(default = "default_catchup_margin")]
    pub catchup_margin: i64,

    /// Upper bound on applications queued in the commit manager.
    #[serde(default = "default_max_pending_applications")]
    pub max_pending_applications: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_ms: default_election_timeout_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            catchup_margin: default_catchup_margin(),
            max_pending_applications: default_max_pending_applications(),
        }
    }
}

impl RaftOptions {
    /// Loads options with hierarchical override support: code defaults,
    /// then an optional config file, then `REPLICORE__`-prefixed
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let options: RaftOptions = builder
            .add_source(Environment::with_prefix("REPLICORE").separator("__"))
            .build()?
            .try_deserialize()?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms == 0 {
            return Err(config::ConfigError::Message(
                "election_timeout_ms must be at least 1ms".into(),
            )
            .into());
        }
        if self.catchup_margin <= 0 {
            return Err(
                config::ConfigError::Message("catchup_margin must be > 0".into()).into(),
            );
        }
        if self.max_pending_applications == 0 {
            return Err(config::ConfigError::Message(
                "max_pending_applications must be > 0".into(),
            )
            .into());
        }
        Ok(())
    }
}

fn default_election_timeout_ms() -> u64 {
    1000
}
fn default_snapshot_interval_ms() -> u64 {
    3_600_000
}
fn default_catchup_margin() -> i64 {
    1000
}
fn default_max_pending_applications() -> usize {
    1000
}

/// Everything a replica needs beyond its identity.
#[derive(Clone)]
pub struct NodeOptions {
    pub raft: RaftOptions,

    /// Log storage URI, dispatched to a registered storage driver.
    pub log_uri: String,

    /// Stable storage (term + vote) URI.
    pub stable_uri: String,

    /// Snapshot storage URI; empty disables snapshots entirely.
    pub snapshot_uri: String,

    /// Bootstrap peer set, consulted only when the log is empty.
    pub conf: Configuration,

    /// The user state machine committed entries are applied to.
    pub fsm: Arc<dyn StateMachine>,
}

impl NodeOptions {
    pub fn new(fsm: Arc<dyn StateMachine>) -> Self {
        Self {
            raft: RaftOptions::default(),
            log_uri: String::new(),
            stable_uri: String::new(),
            snapshot_uri: String::new(),
            conf: Configuration::new(),
            fsm,
        }
    }
}

impl Debug for NodeOptions {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("raft", &self.raft)
            .field("log_uri", &self.log_uri)
            .field("stable_uri", &self.stable_uri)
            .field("snapshot_uri", &self.snapshot_uri)
            .field("conf", &self.conf)
            .finish()
    }
}
