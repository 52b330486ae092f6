//! # replicore
//!
//! The node core of a Raft replicated-state-machine library: the
//! per-replica object driving leader election, log replication,
//! configuration change and snapshot coordination on a single machine of
//! a replication group.
//!
//! The crate owns the hard part, the node state machine and its
//! serialized mutation protocol, and expresses everything with its own
//! threading as trait contracts: log manager, stable storage, snapshot
//! storage, commit manager, state-machine caller, replicator group and
//! outbound transport.
//!
//! ## Quick start
//! ```ignore
//! use replicore::{NodeBuilder, NodeManager, NodeOptions};
//!
//! NodeManager::global().init("127.0.0.1:8000".parse()?)?;
//!
//! let node = NodeBuilder::new("my-group", 0)
//!     .options(options)
//!     .commit_manager(commit_manager)
//!     .fsm_caller(fsm_caller)
//!     .replicator_group(replicator_group)
//!     .transport(transport)
//!     .build()?;
//! node.init().await?;
//! ```
//!
//! Inbound RPCs are routed through [`NodeManager::get`] to
//! [`Node::handle_request_vote`], [`Node::handle_append_entries`] and
//! [`Node::handle_install_snapshot`].

pub mod config;
pub mod membership;
pub mod proto;
pub mod storage;

mod constants;
mod core;
mod errors;
mod network;
mod node_manager;

pub use config::*;
pub use core::*;
pub use errors::*;
pub use membership::*;
pub use network::*;
pub use node_manager::*;
pub use storage::*;

//-----------------------------------------------------------
// Test utils
#[cfg(test)]
#[doc(hidden)]
pub mod test_utils;

//-----------------------------------------------------------
// Autometrics
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;

#[doc(hidden)]
pub(crate) const API_SLO: Objective = Objective::new("replicore_api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms100, ObjectivePercentile::P99);
