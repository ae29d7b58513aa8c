//! Core Data Model
//!
//! Canonical types shared by every sextant crate: protocols, hints, the
//! Node/NodeTransport pair that forms the contract between providers and the
//! discovery engine, and the merge rules used by the graph store.
//!
//! This crate is plain data plus pure methods. Anything that needs
//! configuration (skip lists, CLI flags, provider registries) lives in the
//! `catalog` and `discovery-service` crates.

pub mod node;
pub mod protocol;

pub use node::{
    merge_node, Node, NodeError, NodeHandle, NodeTransport, NodeType, NodeWarning,
    ServiceNameConflict, Tree, DATABASE_MUXES,
};
pub use protocol::{
    Hint, Protocol, PROTOCOL_HINT, PROTOCOL_INVENTORY, PROTOCOL_SEED, PROTOCOL_TCP, PROVIDER_HINT,
    PROVIDER_INVENTORY, PROVIDER_K8S, PROVIDER_SEED, PROVIDER_SSH, PROVIDER_WWW,
};
