//! Protocols and hints.
//!
//! A `Protocol` classifies an edge in the topology (TCP, a message queue, a
//! database wire protocol). Three built-ins (`SEED`, `HNT`, `TCP`) always
//! exist, and user-defined protocols are loaded by the network catalog.
//! A `Hint` is a statically declared edge for services the engine cannot
//! profile on its own.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Well-known provider refs the core treats specially.
pub const PROVIDER_SEED: &str = "seed";
pub const PROVIDER_HINT: &str = "hnt";
pub const PROVIDER_INVENTORY: &str = "inv";
pub const PROVIDER_SSH: &str = "ssh";
pub const PROVIDER_K8S: &str = "k8s";
pub const PROVIDER_WWW: &str = "www";

/// An immutable protocol definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol {
    /// Short unique code, e.g. `TCP` or `NSQ`.
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Display name.
    pub name: String,
    /// Whether a call over this protocol blocks the caller.
    pub blocking: bool,
    #[serde(default)]
    pub is_database: bool,
}

impl Protocol {
    pub fn new(
        ref_: impl Into<String>,
        name: impl Into<String>,
        blocking: bool,
        is_database: bool,
    ) -> Self {
        Self {
            ref_: ref_.into(),
            name: name.into(),
            blocking,
            is_database,
        }
    }
}

pub static PROTOCOL_TCP: Lazy<Protocol> = Lazy::new(|| Protocol::new("TCP", "TCP", true, false));
pub static PROTOCOL_SEED: Lazy<Protocol> =
    Lazy::new(|| Protocol::new("SEED", "Seed", true, false));
pub static PROTOCOL_HINT: Lazy<Protocol> = Lazy::new(|| Protocol::new("HNT", "Hint", true, false));
pub static PROTOCOL_INVENTORY: Lazy<Protocol> =
    Lazy::new(|| Protocol::new("INV", "Inventory", true, false));

/// A statically declared edge: "service X talks to Y over Z, ask provider P".
///
/// Hints supplement discovery for services that cannot be profiled, e.g. a
/// consumer reading from a queue the producer cannot see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    pub service_name: String,
    pub protocol: Protocol,
    pub protocol_mux: String,
    /// Provider ref the discovered child will belong to.
    pub provider: String,
    /// Provider ref asked to resolve the hint into a concrete instance.
    pub instance_provider: String,
}
