//! Process-wide node registry.
//!
//! Maps `(group_id, peer_id)` to the replica living at that address so
//! the embedding RPC server can route inbound Raft and file-transfer
//! calls. Also records the server's bound endpoint, which replicas use
//! as their own peer address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;
use tracing::warn;

use crate::core::Node;
use crate::membership::GroupId;
use crate::membership::NodeId;
use crate::membership::PeerId;
use crate::NodeError;
use crate::Result;

pub struct NodeManager {
    address: RwLock<Option<SocketAddr>>,
    nodes: DashMap<NodeId, Arc<Node>>,
}

impl NodeManager {
    fn new() -> Self {
        Self {
            address: RwLock::new(None),
            nodes: DashMap::new(),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static NodeManager {
        static GLOBAL: OnceLock<NodeManager> = OnceLock::new();
        GLOBAL.get_or_init(NodeManager::new)
    }

    /// Records the endpoint the embedding RPC server bound to. Must be
    /// called once before any node is built.
    pub fn init(
        &self,
        address: SocketAddr,
    ) -> Result<()> {
        let mut slot = self.address.write();
        if let Some(existing) = *slot {
            if existing == address {
                return Ok(());
            }
            warn!("node manager already initialized at {}", existing);
            return Err(NodeError::InvalidArgument(format!(
                "node manager already initialized at {existing}"
            ))
            .into());
        }
        info!("node manager serving at {}", address);
        *slot = Some(address);
        Ok(())
    }

    /// The bound endpoint, once initialized.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.read()
    }

    /// Registers a fully initialized node. Returns false when a node with
    /// the same id already exists.
    pub fn add(
        &self,
        node: Arc<Node>,
    ) -> bool {
        match self.nodes.entry(node.node_id().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(node);
                true
            }
        }
    }

    /// Removes a node; inbound RPCs can no longer reach it afterwards.
    pub fn remove(
        &self,
        node_id: &NodeId,
    ) {
        self.nodes.remove(node_id);
    }

    /// Routes `(group_id, peer_id)` to its replica.
    pub fn get(
        &self,
        group_id: &GroupId,
        peer_id: &PeerId,
    ) -> Option<Arc<Node>> {
        self.nodes
            .get(&NodeId::new(group_id.clone(), *peer_id))
            .map(|entry| entry.value().clone())
    }

}
