//! Replica identity and peer-set algebra.
//!
//! A replica is addressed by its [`PeerId`] (endpoint plus replica index,
//! so several replicas of different groups can share one server process)
//! and scoped by the opaque [`GroupId`] of its replication group. The
//! [`Configuration`] type carries the peer set the consensus algorithm
//! computes quorums against.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeError;

/// Opaque identifier of a replication group. Used only as a routing key.
pub type GroupId = String;

/// Network identity of a single replica: endpoint plus replica index.
///
/// Text form is `ip:port:idx`; the `:idx` suffix may be omitted and
/// defaults to `0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub addr: SocketAddr,
    pub idx: u32,
}

impl PeerId {
    pub fn new(
        addr: SocketAddr,
        idx: u32,
    ) -> Self {
        Self { addr, idx }
    }

    /// Parses `ip:port:idx` (or `ip:port`), mapping malformed input to
    /// [`NodeError::InvalidArgument`].
    pub fn parse(s: &str) -> std::result::Result<Self, NodeError> {
        s.parse()
            .map_err(|_| NodeError::InvalidArgument(format!("bad peer id: {s}")))
    }
}

impl fmt::Display for PeerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.idx)
    }
}

impl FromStr for PeerId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self { addr, idx: 0 });
        }
        let (addr_part, idx_part) = match s.rsplit_once(':') {
            Some(split) => split,
            // Unreachable separator: force the address error below.
            None => (s, "0"),
        };
        let addr = addr_part.parse::<SocketAddr>()?;
        // An unparsable index falls back to the full-string parse error.
        match idx_part.parse::<u32>() {
            Ok(idx) => Ok(Self { addr, idx }),
            Err(_) => s.parse::<SocketAddr>().map(|addr| Self { addr, idx: 0 }),
        }
    }
}

/// Registry key of a replica: which group, which peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pub group_id: GroupId,
    pub peer_id: PeerId,
}

impl NodeId {
    pub fn new(
        group_id: GroupId,
        peer_id: PeerId,
    ) -> Self {
        Self { group_id, peer_id }
    }
}

impl fmt::Display for NodeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.peer_id)
    }
}

/// The peer set of a replication group.
///
/// Stored ordered so that iteration, wire encoding and logging are
/// deterministic across replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    peers: BTreeSet<PeerId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(
        &self,
        peer: &PeerId,
    ) -> bool {
        self.peers.contains(peer)
    }

    pub fn contains_all(
        &self,
        peers: &[PeerId],
    ) -> bool {
        peers.iter().all(|p| self.peers.contains(p))
    }

    /// Set equality against a plain peer list.
    pub fn equals(
        &self,
        peers: &[PeerId],
    ) -> bool {
        self.peers.len() == peers.len() && self.contains_all(peers)
    }

    pub fn add_peer(
        &mut self,
        peer: PeerId,
    ) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(
        &mut self,
        peer: &PeerId,
    ) -> bool {
        self.peers.remove(peer)
    }

    pub fn reset(&mut self) {
        self.peers.clear();
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn peer_vec(&self) -> Vec<PeerId> {
        self.peers.iter().copied().collect()
    }

    /// Smallest majority of this peer set.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

impl FromIterator<PeerId> for Configuration {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

impl From<&[PeerId]> for Configuration {
    fn from(peers: &[PeerId]) -> Self {
        peers.iter().copied().collect()
    }
}

impl fmt::Display for Configuration {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{{")?;
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{peer}")?;
        }
        write!(f, "}}")
    }
}

/// The configuration in effect at or before a given log index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigurationPair {
    /// Log index of the entry that established `conf`; `0` when none.
    pub index: i64,
    pub conf: Configuration,
}
