//! Network Catalog and Profile-Strategy Registry
//!
//! Loads the operator-maintained YAML describing the known network: protocol
//! definitions, skip lists, service-name rewrites and hints (`network.rs`),
//! plus the declarative profile strategies that tell providers how to
//! enumerate a node's downstream dependencies (`strategy.rs`). Line-oriented
//! profile responses are parsed into `NodeTransport`s in `response.rs`.
//!
//! All loading is fail-fast: malformed input surfaces as a `CatalogError`
//! before discovery starts.

pub mod error;
pub mod network;
pub mod response;
pub mod strategy;

pub use error::CatalogError;
pub use network::NetworkCatalog;
pub use response::{parse_profile_response, ResponseParseError};
pub use strategy::{
    hint_strategy, ChildAssignment, ChildProviderRule, ProfileStrategy, ServiceNameFilter,
    StrategyRegistry, HINT_DISCOVERY_STRATEGY, INVENTORY_PROFILE_STRATEGY, SEED_PROFILE_STRATEGY,
};
