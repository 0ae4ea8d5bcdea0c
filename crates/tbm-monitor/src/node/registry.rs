//! Node lookup by gid and by address.

use std::collections::BTreeMap;

use tracing::info;

use tbm_core::{Gid, NodeDescriptor, RosterError};

use super::{Node, NodeContext};
use crate::error::{MonitorError, Result};
use crate::fanout::NodeCollection;

/// Every node of the roster, keyed by gid.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<Gid, Node>,
}

impl NodeRegistry {
    /// Creates one unseen node per descriptor.
    ///
    /// Fails on a repeated gid.
    pub fn build(descriptors: Vec<NodeDescriptor>, ctx: &NodeContext) -> Result<Self> {
        let mut nodes: BTreeMap<Gid, Node> = BTreeMap::new();

        for descriptor in descriptors {
            if let Some(existing) = nodes.get(&descriptor.gid) {
                return Err(RosterError::DuplicateGid {
                    gid: descriptor.gid.clone(),
                    line: descriptor.line,
                    first: existing.descriptor().line,
                }
                .into());
            }
            let node = Node::new(descriptor, ctx.clone())?;
            nodes.insert(node.gid().clone(), node);
        }

        info!(count = nodes.len(), "Node registry built");
        Ok(Self { nodes })
    }

    pub fn get(&self, gid: &str) -> Option<&Node> {
        self.nodes.get(&Gid::new(gid))
    }

    /// Like `get`, but a missing gid is an error.
    pub fn require(&self, gid: &str) -> Result<&Node> {
        self.get(gid).ok_or_else(|| MonitorError::UnknownNode {
            gid: Gid::new(gid),
        })
    }

    /// Finds the node whose client lives at `ip:port`.
    ///
    /// Only nodes that have been seen have an address.
    pub fn find_by_address(&self, ip: &str, port: u16) -> Option<&Node> {
        self.nodes.values().find(|node| {
            node.address()
                .is_some_and(|addr| addr.ip == ip && addr.port == port)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in gid order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All nodes as a collection.
    pub fn collection(&self) -> NodeCollection {
        NodeCollection::new(self.nodes.values().cloned())
    }
}
