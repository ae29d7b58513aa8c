//! Graph Store
//!
//! The merge/dedup layer between discovery and persistence. `GraphStore` is
//! the seam a property-graph backend plugs into; `MemoryGraph` is the
//! in-process implementation used by the engine and by tests.
//!
//! Identity: the primary key of a persisted node is `(provider, address)`.
//! A node without an address is identified by any overlapping alias. `save`
//! is an idempotent upsert that merges field-by-field (see
//! `types::merge_node`); `connect` records a typed edge derived from the
//! node-type pair and refuses unsupported pairs.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use types::{merge_node, Node, NodeType, PROVIDER_K8S};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node {debug_id} has neither address nor aliases and cannot be persisted")]
    NotPersistable { debug_id: String },

    #[error("unsupported edge: {parent} -> {child}")]
    InvalidEdge { parent: NodeType, child: NodeType },

    #[error("node {debug_id} not found in graph")]
    NodeNotFound { debug_id: String },
}

/// Edge classification derived from the (parent, child) node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Compute -> Compute
    Calls,
    /// Compute -> Resource
    Uses,
    /// Compute -> TrafficController
    RoutesVia,
    /// Deployment -> Compute
    Manages,
    /// TrafficController -> Deployment
    RoutesTo,
}

/// Derive the edge kind for a (parent, child) node-type pair.
pub fn edge_kind(parent: NodeType, child: NodeType) -> Result<EdgeKind, GraphError> {
    match (parent, child) {
        (NodeType::Compute, NodeType::Compute) => Ok(EdgeKind::Calls),
        (NodeType::Compute, NodeType::Resource) => Ok(EdgeKind::Uses),
        (NodeType::Compute, NodeType::TrafficController) => Ok(EdgeKind::RoutesVia),
        (NodeType::Deployment, NodeType::Compute) => Ok(EdgeKind::Manages),
        (NodeType::TrafficController, NodeType::Deployment) => Ok(EdgeKind::RoutesTo),
        (parent, child) => Err(GraphError::InvalidEdge { parent, child }),
    }
}

/// The persistence seam. In-memory is sufficient for discovery and tests; a
/// property-graph writer implements the same contract.
pub trait GraphStore: Send + Sync {
    /// Idempotent upsert; returns the merged node.
    fn save(&self, node: &Node) -> Result<Node, GraphError>;

    /// Record a directed, typed edge between two saved nodes.
    fn connect(&self, parent: &Node, child: &Node) -> Result<EdgeKind, GraphError>;

    fn by_address(&self, address: &str) -> Option<Node>;

    /// Nodes known only by alias: one `(alias, node)` entry per alias.
    fn pending_dns_lookup(&self) -> Vec<(String, Node)>;

    /// Addressed nodes that have never been profiled.
    fn unprofiled(&self) -> Vec<Node>;

    fn is_k8s_load_balancer(&self, address: &str) -> bool;

    fn is_k8s_service(&self, address: &str) -> bool;
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    edges: Vec<(usize, EdgeKind, usize)>,
}

impl Inner {
    fn find(&self, node: &Node) -> Option<usize> {
        if node.address.is_some() {
            if let Some(idx) = self
                .nodes
                .iter()
                .position(|n| n.provider == node.provider && n.address == node.address)
            {
                return Some(idx);
            }
        }
        self.nodes.iter().position(|n| {
            n.aliases
                .iter()
                .any(|alias| node.aliases.contains(alias))
        })
    }
}

/// In-memory `GraphStore`.
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<Inner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded edges as (parent, kind, child) clones.
    pub fn edges(&self) -> Vec<(Node, EdgeKind, Node)> {
        let inner = self.inner.read();
        inner
            .edges
            .iter()
            .map(|&(p, kind, c)| (inner.nodes[p].clone(), kind, inner.nodes[c].clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }
}

impl GraphStore for MemoryGraph {
    fn save(&self, node: &Node) -> Result<Node, GraphError> {
        if !node.persistable() {
            return Err(GraphError::NotPersistable {
                debug_id: node.debug_id(),
            });
        }
        let mut inner = self.inner.write();
        match inner.find(node) {
            Some(idx) => {
                merge_node(&mut inner.nodes[idx], node);
                Ok(inner.nodes[idx].clone())
            }
            None => {
                debug!(node = %node.debug_id(), "saving new graph node");
                inner.nodes.push(node.clone());
                Ok(node.clone())
            }
        }
    }

    fn connect(&self, parent: &Node, child: &Node) -> Result<EdgeKind, GraphError> {
        let mut inner = self.inner.write();
        let parent_idx = inner.find(parent).ok_or_else(|| GraphError::NodeNotFound {
            debug_id: parent.debug_id(),
        })?;
        let child_idx = inner.find(child).ok_or_else(|| GraphError::NodeNotFound {
            debug_id: child.debug_id(),
        })?;
        let kind = edge_kind(inner.nodes[parent_idx].node_type, inner.nodes[child_idx].node_type)?;
        let edge = (parent_idx, kind, child_idx);
        if !inner.edges.contains(&edge) {
            inner.edges.push(edge);
        }
        Ok(kind)
    }

    fn by_address(&self, address: &str) -> Option<Node> {
        self.inner
            .read()
            .nodes
            .iter()
            .find(|n| n.address.as_deref() == Some(address))
            .cloned()
    }

    fn pending_dns_lookup(&self) -> Vec<(String, Node)> {
        let inner = self.inner.read();
        let mut pending = vec![];
        for node in inner.nodes.iter().filter(|n| n.address.is_none()) {
            for alias in &node.aliases {
                pending.push((alias.clone(), node.clone()));
            }
        }
        pending
    }

    fn unprofiled(&self) -> Vec<Node> {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|n| n.profile_timestamp.is_none() && n.address.is_some())
            .cloned()
            .collect()
    }

    fn is_k8s_load_balancer(&self, address: &str) -> bool {
        self.inner.read().nodes.iter().any(|n| {
            n.provider == PROVIDER_K8S
                && n.node_type == NodeType::TrafficController
                && n.address.as_deref() == Some(address)
        })
    }

    fn is_k8s_service(&self, address: &str) -> bool {
        self.inner.read().nodes.iter().any(|n| {
            n.provider == PROVIDER_K8S
                && n.node_type == NodeType::Deployment
                && n.address.as_deref() == Some(address)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{NodeTransport, NodeWarning, PROTOCOL_TCP};

    fn node(provider: &str, address: Option<&str>, node_type: NodeType) -> Node {
        let nt = NodeTransport::new(
            "stub",
            provider,
            PROTOCOL_TCP.clone(),
            "8080",
            address.map(str::to_string),
            false,
            None,
            None,
        );
        let mut n = Node::from_transport(&nt, false);
        n.provider = provider.to_string(); // keep test providers out of www re-homing
        n.node_type = node_type;
        n.errors.clear();
        n
    }

    #[test]
    fn save_inserts_then_merges() {
        let store = MemoryGraph::new();
        let mut first = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        first.warnings.insert(NodeWarning::Defunct);
        store.save(&first).unwrap();
        assert_eq!(store.len(), 1);

        let mut second = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        second.service_name = Some("svc-a".to_string());
        let merged = store.save(&second).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(merged.service_name.as_deref(), Some("svc-a"));
        assert!(merged.warnings.contains(&NodeWarning::Defunct));
    }

    #[test]
    fn save_requires_address_or_alias() {
        let store = MemoryGraph::new();
        let n = node("ssh", None, NodeType::Compute);
        assert!(matches!(
            store.save(&n),
            Err(GraphError::NotPersistable { .. })
        ));
    }

    #[test]
    fn alias_overlap_is_identity_when_address_is_absent() {
        let store = MemoryGraph::new();
        let mut known = node("ssh", None, NodeType::Resource);
        known.aliases = vec!["orders-db.example.com".to_string()];
        store.save(&known).unwrap();

        let mut found = node("ssh", Some("10.0.0.9"), NodeType::Resource);
        found.aliases = vec![
            "orders-db.example.com".to_string(),
            "db9.example.com".to_string(),
        ];
        let merged = store.save(&found).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(merged.address.as_deref(), Some("10.0.0.9"));
        assert_eq!(merged.aliases.len(), 2);
    }

    #[test]
    fn connect_derives_edge_kind_from_types() {
        let store = MemoryGraph::new();
        let compute = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        let resource = node("aws", Some("10.0.0.2"), NodeType::Resource);
        store.save(&compute).unwrap();
        store.save(&resource).unwrap();

        let kind = store.connect(&compute, &resource).unwrap();
        assert_eq!(kind, EdgeKind::Uses);
        assert_eq!(store.edges().len(), 1);

        // idempotent
        store.connect(&compute, &resource).unwrap();
        assert_eq!(store.edges().len(), 1);
    }

    #[test]
    fn connect_refuses_unsupported_pairs() {
        let store = MemoryGraph::new();
        let resource = node("aws", Some("10.0.0.2"), NodeType::Resource);
        let compute = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        store.save(&resource).unwrap();
        store.save(&compute).unwrap();

        assert!(matches!(
            store.connect(&resource, &compute),
            Err(GraphError::InvalidEdge { .. })
        ));
    }

    #[test]
    fn edge_kind_table() {
        assert_eq!(
            edge_kind(NodeType::Deployment, NodeType::Compute).unwrap(),
            EdgeKind::Manages
        );
        assert_eq!(
            edge_kind(NodeType::TrafficController, NodeType::Deployment).unwrap(),
            EdgeKind::RoutesTo
        );
        assert_eq!(
            edge_kind(NodeType::Compute, NodeType::TrafficController).unwrap(),
            EdgeKind::RoutesVia
        );
        assert!(edge_kind(NodeType::Null, NodeType::Compute).is_err());
    }

    #[test]
    fn pending_dns_lookup_and_unprofiled_queries() {
        let store = MemoryGraph::new();
        let mut aliased = node("ssh", None, NodeType::Resource);
        aliased.aliases = vec!["a.example.com".to_string(), "b.example.com".to_string()];
        store.save(&aliased).unwrap();

        let mut profiled = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        profiled.profile_timestamp = Some(chrono::Utc::now());
        store.save(&profiled).unwrap();

        let fresh = node("ssh", Some("10.0.0.2"), NodeType::Compute);
        store.save(&fresh).unwrap();

        let pending = store.pending_dns_lookup();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|(alias, _)| alias == "a.example.com"));

        let unprofiled = store.unprofiled();
        assert_eq!(unprofiled.len(), 1);
        assert_eq!(unprofiled[0].address.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn k8s_typed_queries() {
        let store = MemoryGraph::new();
        let lb = node("k8s", Some("10.96.0.10"), NodeType::TrafficController);
        let svc = node("k8s", Some("10.96.0.11"), NodeType::Deployment);
        let plain = node("ssh", Some("10.0.0.1"), NodeType::Compute);
        store.save(&lb).unwrap();
        store.save(&svc).unwrap();
        store.save(&plain).unwrap();

        assert!(store.is_k8s_load_balancer("10.96.0.10"));
        assert!(!store.is_k8s_load_balancer("10.96.0.11"));
        assert!(store.is_k8s_service("10.96.0.11"));
        assert!(!store.is_k8s_service("10.0.0.1"));
    }
}
