//! The network catalog: protocols, skips, rewrites and hints.
//!
//! Catalog files are YAML maps with four recognized top-level keys:
//!
//! ```yaml
//! protocols:
//!   NSQ: {name: NSQ, blocking: false}
//!   MYSQL: {name: MySQL, blocking: true, is_database: true}
//! skips:
//!   addresses: ["169.254."]
//!   service_names: ["sandbox"]
//!   protocol_muxes: ["9100"]
//! service-name-rewrites:
//!   "-green": "green-${protocol_mux}"
//! hints:
//!   web-frontend:
//!     - service_name: order-worker
//!       protocol: NSQ
//!       protocol_mux: "orders:consume"
//!       provider: ssh
//!       instance_provider: aws
//! ```
//!
//! Several files may be loaded; later files add to earlier ones. Skip
//! matching is substring-based, and `skip_address` additionally matches the
//! standard metadata CIDRs.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use cidr::IpCidr;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use types::{
    Hint, Node, Protocol, PROTOCOL_HINT, PROTOCOL_INVENTORY, PROTOCOL_SEED, PROTOCOL_TCP,
};

use crate::error::CatalogError;

static IGNORED_NETWORKS: Lazy<Vec<IpCidr>> = Lazy::new(|| {
    ["169.254.169.254/32"]
        .iter()
        .map(|c| c.parse().expect("builtin CIDR"))
        .collect()
});

static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

#[derive(Debug, Deserialize)]
struct RawProtocol {
    name: String,
    blocking: bool,
    #[serde(default)]
    is_database: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawSkips {
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    service_names: Vec<String>,
    #[serde(default)]
    protocol_muxes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawHint {
    /// The downstream service this edge points at.
    service_name: String,
    protocol: String,
    protocol_mux: String,
    provider: String,
    instance_provider: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    protocols: BTreeMap<String, RawProtocol>,
    #[serde(default)]
    skips: RawSkips,
    /// serde_yaml::Mapping preserves declaration order; first match wins.
    #[serde(default, rename = "service-name-rewrites")]
    service_name_rewrites: serde_yaml::Mapping,
    #[serde(default)]
    hints: BTreeMap<String, Vec<RawHint>>,
}

/// Loaded view of one or more catalog files.
#[derive(Debug, Default)]
pub struct NetworkCatalog {
    protocols: HashMap<String, Protocol>,
    user_protocol_count: usize,
    hints: HashMap<String, Vec<Hint>>,
    skip_addresses: Vec<String>,
    skip_service_names: Vec<String>,
    skip_protocol_muxes: Vec<String>,
    rewrites: Vec<(String, String)>,
}

impl NetworkCatalog {
    /// Catalog with only the built-in protocols registered. Does not pass
    /// validation until at least one user protocol is added.
    pub fn builtin() -> Self {
        let mut protocols = HashMap::new();
        for protocol in [
            &*PROTOCOL_SEED,
            &*PROTOCOL_HINT,
            &*PROTOCOL_TCP,
            &*PROTOCOL_INVENTORY,
        ] {
            protocols.insert(protocol.ref_.clone(), protocol.clone());
        }
        Self {
            protocols,
            ..Self::default()
        }
    }

    /// Load and validate catalog files, failing fast on malformed input.
    pub fn load<P: AsRef<Path>>(files: &[P]) -> Result<Self, CatalogError> {
        let mut catalog = Self::builtin();
        for file in files {
            catalog.load_file(file.as_ref())?;
        }
        catalog.validate()?;
        Ok(catalog)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), CatalogError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| CatalogError::io(path.to_owned(), e))?;
        let raw: RawCatalog =
            serde_yaml::from_str(&text).map_err(|e| CatalogError::parse(path.to_owned(), e))?;
        self.absorb(raw)?;
        debug!(file = %path.display(), "loaded network catalog file");
        Ok(())
    }

    fn absorb(&mut self, raw: RawCatalog) -> Result<(), CatalogError> {
        for (ref_, proto) in raw.protocols {
            self.protocols.insert(
                ref_.clone(),
                Protocol::new(ref_, proto.name, proto.blocking, proto.is_database),
            );
            self.user_protocol_count += 1;
        }

        self.skip_addresses.extend(raw.skips.addresses);
        self.skip_service_names.extend(raw.skips.service_names);
        self.skip_protocol_muxes.extend(raw.skips.protocol_muxes);

        for (key, value) in raw.service_name_rewrites {
            let (Some(match_), Some(rewrite)) = (key.as_str(), value.as_str()) else {
                continue;
            };
            self.rewrites.push((match_.to_string(), rewrite.to_string()));
        }

        // Hints are keyed by the service that owns the edge and reference
        // protocols by ref; resolve both now so a bad ref is a load-time
        // failure rather than a mid-discovery one.
        for (owner, records) in raw.hints {
            let mut resolved = Vec::with_capacity(records.len());
            for record in records {
                let protocol = self.protocol(&record.protocol)?.clone();
                resolved.push(Hint {
                    service_name: record.service_name,
                    protocol,
                    protocol_mux: record.protocol_mux,
                    provider: record.provider,
                    instance_provider: record.instance_provider,
                });
            }
            self.hints.entry(owner).or_default().extend(resolved);
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.user_protocol_count == 0 {
            return Err(CatalogError::NoUserProtocols);
        }
        Ok(())
    }

    pub fn protocol(&self, ref_: &str) -> Result<&Protocol, CatalogError> {
        self.protocols
            .get(ref_)
            .ok_or_else(|| CatalogError::unknown_protocol(ref_))
    }

    pub fn hints(&self, service_name: &str) -> &[Hint] {
        self.hints
            .get(service_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Fold additional mux skips (e.g. from the CLI) into the catalog lists
    /// so the engine has a single predicate to consult.
    pub fn extend_skip_protocol_muxes<I, S>(&mut self, muxes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_protocol_muxes
            .extend(muxes.into_iter().map(Into::into));
    }

    pub fn skip_address(&self, address: &str) -> bool {
        if self.skip_addresses.iter().any(|m| address.contains(m)) {
            return true;
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return IGNORED_NETWORKS.iter().any(|net| net.contains(&ip));
        }
        false
    }

    pub fn skip_service_name(&self, service_name: &str) -> bool {
        self.skip_service_names
            .iter()
            .any(|m| service_name.contains(m))
    }

    pub fn skip_protocol_mux(&self, protocol_mux: &str) -> bool {
        self.skip_protocol_muxes
            .iter()
            .any(|m| protocol_mux.contains(m))
    }

    /// Rewrite a resolved service name. The first configured substring match
    /// wins; the replacement is a template that may reference node
    /// attributes, e.g. `green-${protocol_mux}`.
    pub fn rewrite_service_name(&self, service_name: &str, node: &Node) -> String {
        for (match_, rewrite) in &self.rewrites {
            if service_name.contains(match_) {
                return substitute_template(rewrite, node);
            }
        }
        service_name.to_string()
    }
}

/// Substitute `${attr}` / `$attr` against the node's serialized field map,
/// so any node attribute is reachable from a rewrite. An unknown attribute
/// is left as literal text.
fn substitute_template(template: &str, node: &Node) -> String {
    let attrs = serde_json::to_value(node).unwrap_or(serde_json::Value::Null);
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let var = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match attrs.get(var) {
                Some(value) => render_attribute(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn render_attribute(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
