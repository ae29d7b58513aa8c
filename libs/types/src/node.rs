//! Nodes and the NodeTransport value object.
//!
//! `NodeTransport` is the immutable record a provider hands back for each
//! discovered child; `Node` is the mutable graph vertex the engine owns.
//! Nodes are shared between the engine, the graph store and the live
//! exporter through `NodeHandle` (`Arc<RwLock<Node>>`); locks are only ever
//! held for short, non-await critical sections.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Protocol, PROVIDER_WWW};

/// Muxes that mark a node as a database regardless of protocol.
pub const DATABASE_MUXES: [&str; 5] = ["3306", "9160", "5432", "6379", "11211"];

/// Shared handle to a node in the working tree.
pub type NodeHandle = Arc<RwLock<Node>>;

/// A working set of nodes keyed by synthetic node ref.
pub type Tree = HashMap<String, NodeHandle>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Null,
    Compute,
    Resource,
    Deployment,
    TrafficController,
    Unknown,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Null => "NULL",
            NodeType::Compute => "COMPUTE",
            NodeType::Resource => "RESOURCE",
            NodeType::Deployment => "DEPLOYMENT",
            NodeType::TrafficController => "TRAFFIC_CONTROLLER",
            NodeType::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Terminal error tags. A node carrying any of these is never profiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeError {
    ConnectSkipped,
    Timeout,
    NullAddress,
    Cycle,
    ProfileSkipped,
}

/// Non-terminal diagnostic tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeWarning {
    NameLookupFailed,
    Defunct,
}

/// Data transport object for a discovered child. Forms the binding contract
/// between providers and the discovery engine.
///
/// `protocol_mux` is always textual; numeric muxes are stringified at
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTransport {
    pub profile_strategy_name: String,
    pub provider: String,
    pub protocol: Protocol,
    pub protocol_mux: String,
    pub address: Option<String>,
    #[serde(default)]
    pub from_hint: bool,
    pub debug_identifier: Option<String>,
    pub num_connections: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub node_type: NodeType,
}

impl NodeTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile_strategy_name: impl Into<String>,
        provider: impl Into<String>,
        protocol: Protocol,
        protocol_mux: impl ToString,
        address: Option<String>,
        from_hint: bool,
        debug_identifier: Option<String>,
        num_connections: Option<u64>,
    ) -> Self {
        Self {
            profile_strategy_name: profile_strategy_name.into(),
            provider: provider.into(),
            protocol,
            protocol_mux: protocol_mux.to_string(),
            address,
            from_hint,
            debug_identifier,
            num_connections,
            metadata: BTreeMap::new(),
            node_type: NodeType::Null,
        }
    }

    /// Synthetic ref a child is indexed under in its parent's children map:
    /// `<protocol>_<address>_<mux>_<debug identifier>`, absent parts skipped.
    pub fn node_ref(&self) -> String {
        let parts = [
            Some(self.protocol.ref_.as_str()),
            self.address.as_deref(),
            Some(self.protocol_mux.as_str()),
            self.debug_identifier.as_deref(),
        ];
        parts.into_iter().flatten().collect::<Vec<_>>().join("_")
    }
}

/// Raised when a second name resolution disagrees with the assigned name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("service name already assigned: have \"{existing}\", got \"{incoming}\"")]
pub struct ServiceNameConflict {
    pub existing: String,
    pub incoming: String,
}

/// The canonical graph vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub profile_strategy_name: String,
    pub provider: String,
    pub protocol: Protocol,
    pub protocol_mux: String,
    #[serde(default)]
    pub containerized: bool,
    #[serde(default)]
    pub from_hint: bool,
    #[serde(default)]
    pub public_ip: bool,
    pub address: Option<String>,
    #[serde(default)]
    pub ipaddrs: Vec<String>,
    pub node_name: Option<String>,
    pub service_name: Option<String>,
    /// DNS names this node is known by.
    #[serde(default)]
    pub aliases: Vec<String>,
    pub profile_timestamp: Option<DateTime<Utc>>,
    pub profile_lock_time: Option<DateTime<Utc>>,
    /// Child ref -> child node. Not serialized directly; the snapshot layer
    /// re-nests children with a visited set to survive cache-shared handles.
    #[serde(skip)]
    pub children: Tree,
    #[serde(default)]
    pub warnings: BTreeSet<NodeWarning>,
    #[serde(default)]
    pub errors: BTreeSet<NodeError>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub node_type: NodeType,
    pub cluster: Option<String>,
}

impl Node {
    /// Construct a child node from a provider-reported transport.
    ///
    /// Applies the pure classification rules: public-IP detection (a global
    /// address re-homes the node to the `www` provider), hint naming, and the
    /// NULL_ADDRESS / DEFUNCT diagnostics.
    pub fn from_transport(transport: &NodeTransport, containerized: bool) -> Self {
        let parsed_ip = transport.address.as_deref().and_then(parse_ip);
        let public_ip = parsed_ip.map(is_public_ip).unwrap_or(false);

        let mut node = Node {
            profile_strategy_name: transport.profile_strategy_name.clone(),
            provider: if public_ip {
                PROVIDER_WWW.to_string()
            } else {
                transport.provider.clone()
            },
            protocol: transport.protocol.clone(),
            protocol_mux: transport.protocol_mux.clone(),
            containerized,
            from_hint: transport.from_hint,
            public_ip,
            address: transport.address.clone(),
            ipaddrs: match (parsed_ip, &transport.address) {
                (Some(_), Some(addr)) => vec![addr.clone()],
                _ => vec![],
            },
            node_name: None,
            service_name: if transport.from_hint {
                transport.debug_identifier.clone()
            } else {
                None
            },
            aliases: vec![],
            profile_timestamp: None,
            profile_lock_time: None,
            children: HashMap::new(),
            warnings: BTreeSet::new(),
            errors: BTreeSet::new(),
            metadata: transport.metadata.clone(),
            node_type: transport.node_type,
            cluster: None,
        };

        match transport.address.as_deref() {
            None | Some("null") | Some("") => {
                node.errors.insert(NodeError::NullAddress);
            }
            _ => {}
        }
        if transport.num_connections == Some(0) {
            node.warnings.insert(NodeWarning::Defunct);
        }

        node
    }

    pub fn into_handle(self) -> NodeHandle {
        Arc::new(RwLock::new(self))
    }

    /// Short human identifier for logs: `provider:address-or-alias`.
    pub fn debug_id(&self) -> String {
        let clarifier = self
            .aliases
            .first()
            .map(String::as_str)
            .or(self.address.as_deref())
            .unwrap_or("UNKNOWN");
        let id = format!("{}:{}", self.provider, clarifier);
        if id.len() > 60 {
            format!("{}...", &id[..60])
        } else {
            id
        }
    }

    /// A node is persistable iff it has an address or at least one alias.
    pub fn persistable(&self) -> bool {
        self.address.is_some() || !self.aliases.is_empty()
    }

    pub fn is_database(&self) -> bool {
        DATABASE_MUXES.contains(&self.protocol_mux.as_str()) || self.protocol.is_database
    }

    /// Name lookup is settled: we have a name, a terminal error, or lookup
    /// is known to have failed.
    pub fn name_lookup_complete(&self) -> bool {
        self.service_name.is_some()
            || !self.errors.is_empty()
            || self.warnings.contains(&NodeWarning::NameLookupFailed)
    }

    /// Assign the service name for this discovery epoch. A second assignment
    /// must agree with the first.
    pub fn assign_service_name(
        &mut self,
        name: impl Into<String>,
    ) -> Result<(), ServiceNameConflict> {
        let incoming = name.into();
        match &self.service_name {
            Some(existing) if *existing != incoming => Err(ServiceNameConflict {
                existing: existing.clone(),
                incoming,
            }),
            _ => {
                self.service_name = Some(incoming);
                Ok(())
            }
        }
    }

    pub fn set_profile_timestamp(&mut self) {
        self.profile_timestamp = Some(Utc::now());
    }

    pub fn acquire_profile_lock(&mut self) {
        self.profile_lock_time = Some(Utc::now());
    }

    pub fn clear_profile_lock(&mut self) {
        self.profile_lock_time = None;
    }

    pub fn profile_locked(&self) -> bool {
        self.profile_lock_time.is_some()
    }
}

// Children are shared handles and compared structurally by the snapshot
// layer, not here.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.profile_strategy_name == other.profile_strategy_name
            && self.provider == other.provider
            && self.protocol == other.protocol
            && self.protocol_mux == other.protocol_mux
            && self.containerized == other.containerized
            && self.from_hint == other.from_hint
            && self.public_ip == other.public_ip
            && self.address == other.address
            && self.ipaddrs == other.ipaddrs
            && self.node_name == other.node_name
            && self.service_name == other.service_name
            && self.aliases == other.aliases
            && self.profile_timestamp == other.profile_timestamp
            && self.profile_lock_time == other.profile_lock_time
            && self.warnings == other.warnings
            && self.errors == other.errors
            && self.metadata == other.metadata
            && self.node_type == other.node_type
            && self.cluster == other.cluster
    }
}

/// Merge `incoming` into `existing` (the graph-store upsert rule).
///
/// Every field prefers a non-empty incoming value, except `provider` and
/// `node_type` which are sticky once set by inventory. Aliases, warnings and
/// errors are unioned.
pub fn merge_node(existing: &mut Node, incoming: &Node) {
    if !incoming.profile_strategy_name.is_empty() {
        existing.profile_strategy_name = incoming.profile_strategy_name.clone();
    }
    existing.protocol = incoming.protocol.clone();
    if !incoming.protocol_mux.is_empty() {
        existing.protocol_mux = incoming.protocol_mux.clone();
    }
    existing.containerized |= incoming.containerized;
    existing.from_hint |= incoming.from_hint;
    existing.public_ip |= incoming.public_ip;
    if incoming.address.is_some() {
        existing.address = incoming.address.clone();
    }
    if !incoming.ipaddrs.is_empty() {
        existing.ipaddrs = incoming.ipaddrs.clone();
    }
    if incoming.node_name.is_some() {
        existing.node_name = incoming.node_name.clone();
    }
    if incoming.service_name.is_some() {
        existing.service_name = incoming.service_name.clone();
    }
    for alias in &incoming.aliases {
        if !existing.aliases.contains(alias) {
            existing.aliases.push(alias.clone());
        }
    }
    if incoming.profile_timestamp.is_some() {
        existing.profile_timestamp = incoming.profile_timestamp;
    }
    if incoming.profile_lock_time.is_some() {
        existing.profile_lock_time = incoming.profile_lock_time;
    }
    if !incoming.children.is_empty() {
        existing.children = incoming.children.clone();
    }
    existing.warnings.extend(incoming.warnings.iter().copied());
    existing.errors.extend(incoming.errors.iter().copied());
    for (k, v) in &incoming.metadata {
        existing.metadata.insert(k.clone(), v.clone());
    }
    if incoming.cluster.is_some() {
        existing.cluster = incoming.cluster.clone();
    }
}

fn parse_ip(address: &str) -> Option<IpAddr> {
    address.parse().ok()
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    ip.octets()[0] & 0xf0 == 240 && ip != Ipv4Addr::new(255, 255, 255, 255)
}

fn is_special_v4(ip: Ipv4Addr) -> bool {
    is_reserved_v4(ip)
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
}

fn is_special_v6(ip: Ipv6Addr) -> bool {
    // fe80::/10 link-local, fc00::/7 unique-local
    let link_local = (ip.segments()[0] & 0xffc0) == 0xfe80;
    let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
    ip.is_loopback() || ip.is_multicast() || link_local || unique_local
}

fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        // An unspecified address is treated as public here.
        IpAddr::V4(v4) => {
            v4.is_unspecified() || (!is_special_v4(v4) && !v4.is_private())
        }
        IpAddr::V6(v6) => v6.is_unspecified() || !is_special_v6(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PROTOCOL_TCP;

    fn transport(address: Option<&str>) -> NodeTransport {
        NodeTransport::new(
            "stub-strategy",
            "ssh",
            PROTOCOL_TCP.clone(),
            "8080",
            address.map(str::to_string),
            false,
            Some("some-service".to_string()),
            None,
        )
    }

    #[test]
    fn mux_is_stringified_on_construction() {
        let nt = NodeTransport::new(
            "s",
            "ssh",
            PROTOCOL_TCP.clone(),
            9000u16,
            None,
            false,
            None,
            None,
        );
        assert_eq!(nt.protocol_mux, "9000");
    }

    #[test]
    fn node_ref_skips_absent_parts() {
        let mut nt = transport(Some("1.2.3.4"));
        assert_eq!(nt.node_ref(), "TCP_1.2.3.4_8080_some-service");
        nt.address = None;
        nt.debug_identifier = None;
        assert_eq!(nt.node_ref(), "TCP_8080");
    }

    #[test]
    fn from_transport_marks_null_address() {
        for addr in [None, Some("null")] {
            let node = Node::from_transport(&transport(addr), false);
            assert!(node.errors.contains(&NodeError::NullAddress));
        }
        let node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        assert!(node.errors.is_empty());
    }

    #[test]
    fn from_transport_marks_defunct() {
        let mut nt = transport(Some("10.0.0.9"));
        nt.num_connections = Some(0);
        let node = Node::from_transport(&nt, false);
        assert!(node.warnings.contains(&NodeWarning::Defunct));
        assert!(node.errors.is_empty());

        nt.num_connections = Some(3);
        let node = Node::from_transport(&nt, false);
        assert!(node.warnings.is_empty());
    }

    #[test]
    fn from_transport_rehomes_public_ips_to_www() {
        let node = Node::from_transport(&transport(Some("8.8.8.8")), false);
        assert!(node.public_ip);
        assert_eq!(node.provider, PROVIDER_WWW);
        assert_eq!(node.ipaddrs, vec!["8.8.8.8".to_string()]);

        let node = Node::from_transport(&transport(Some("10.1.2.3")), false);
        assert!(!node.public_ip);
        assert_eq!(node.provider, "ssh");

        let node = Node::from_transport(&transport(Some("169.254.1.1")), false);
        assert!(!node.public_ip);

        // reserved future-use range stays on its original provider
        let node = Node::from_transport(&transport(Some("240.0.0.1")), false);
        assert!(!node.public_ip);
        assert_eq!(node.provider, "ssh");
    }

    #[test]
    fn from_transport_names_hint_children() {
        let mut nt = transport(Some("10.0.0.9"));
        nt.from_hint = true;
        let node = Node::from_transport(&nt, false);
        assert_eq!(node.service_name.as_deref(), Some("some-service"));
    }

    #[test]
    fn is_database_by_mux_and_protocol() {
        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        for mux in DATABASE_MUXES {
            node.protocol_mux = mux.to_string();
            assert!(node.is_database(), "{mux} should read as a database");
        }
        node.protocol_mux = "8080".to_string();
        assert!(!node.is_database());
        node.protocol = Protocol::new("MYSQL", "MySQL", true, true);
        assert!(node.is_database());
    }

    #[test]
    fn name_lookup_complete_cases() {
        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        assert!(!node.name_lookup_complete());
        node.warnings.insert(NodeWarning::NameLookupFailed);
        assert!(node.name_lookup_complete());

        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        node.errors.insert(NodeError::Timeout);
        assert!(node.name_lookup_complete());

        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        node.assign_service_name("svc-a").unwrap();
        assert!(node.name_lookup_complete());
    }

    #[test]
    fn assign_service_name_is_write_once() {
        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        node.assign_service_name("svc-a").unwrap();
        // idempotent for the same name
        node.assign_service_name("svc-a").unwrap();
        let err = node.assign_service_name("svc-b").unwrap_err();
        assert_eq!(err.existing, "svc-a");
        assert_eq!(err.incoming, "svc-b");
        assert_eq!(node.service_name.as_deref(), Some("svc-a"));
    }

    #[test]
    fn merge_prefers_incoming_but_keeps_identity_sticky() {
        let mut existing = Node::from_transport(&transport(Some("10.0.0.9")), false);
        existing.node_type = NodeType::Deployment;
        existing.aliases = vec!["a.example.com".to_string()];
        existing.warnings.insert(NodeWarning::Defunct);

        let mut incoming = Node::from_transport(&transport(Some("10.0.0.9")), false);
        incoming.provider = "k8s".to_string();
        incoming.node_type = NodeType::Compute;
        incoming.service_name = Some("svc-a".to_string());
        incoming.aliases = vec!["b.example.com".to_string(), "a.example.com".to_string()];
        incoming
            .warnings
            .insert(NodeWarning::NameLookupFailed);

        merge_node(&mut existing, &incoming);

        assert_eq!(existing.provider, "ssh");
        assert_eq!(existing.node_type, NodeType::Deployment);
        assert_eq!(existing.service_name.as_deref(), Some("svc-a"));
        assert_eq!(
            existing.aliases,
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        assert!(existing.warnings.contains(&NodeWarning::Defunct));
        assert!(existing.warnings.contains(&NodeWarning::NameLookupFailed));
    }

    #[test]
    fn merge_does_not_erase_with_empty_values() {
        let mut existing = Node::from_transport(&transport(Some("10.0.0.9")), false);
        existing.service_name = Some("svc-a".to_string());
        existing.node_name = Some("svc-a-7f9c".to_string());

        let incoming = Node::from_transport(&transport(None), false);
        merge_node(&mut existing, &incoming);

        assert_eq!(existing.address.as_deref(), Some("10.0.0.9"));
        assert_eq!(existing.service_name.as_deref(), Some("svc-a"));
        assert_eq!(existing.node_name.as_deref(), Some("svc-a-7f9c"));
    }

    #[test]
    fn tags_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&NodeType::TrafficController).unwrap(),
            "\"TRAFFIC_CONTROLLER\""
        );
        assert_eq!(
            serde_json::to_string(&NodeError::ConnectSkipped).unwrap(),
            "\"CONNECT_SKIPPED\""
        );
        assert_eq!(
            serde_json::to_string(&NodeWarning::NameLookupFailed).unwrap(),
            "\"NAME_LOOKUP_FAILED\""
        );
    }

    #[test]
    fn profile_lock_round_trip() {
        let mut node = Node::from_transport(&transport(Some("10.0.0.9")), false);
        assert!(!node.profile_locked());
        node.acquire_profile_lock();
        assert!(node.profile_locked());
        node.clear_profile_lock();
        assert!(!node.profile_locked());
    }

    #[test]
    fn persistable_requires_address_or_alias() {
        let mut node = Node::from_transport(&transport(None), false);
        assert!(!node.persistable());
        node.aliases.push("a.example.com".to_string());
        assert!(node.persistable());
        node.aliases.clear();
        node.address = Some("10.0.0.9".to_string());
        assert!(node.persistable());
    }
}
