//! Profile strategies.
//!
//! A strategy is a declarative recipe: which providers may run it, the
//! opaque arguments handed to the provider (e.g. a shell command), how to
//! assign a provider and node type to each discovered child, and which
//! service names it applies to. Strategies are loaded from YAML documents
//! carrying `type: ProfileStrategy`:
//!
//! ```yaml
//! type: ProfileStrategy
//! name: netstat
//! description: enumerate established TCP conns
//! protocol: TCP
//! providers: [ssh, proc]
//! provider_args:
//!   shell_command: "netstat-parse"
//! child_provider:
//!   type: matchPort
//!   matches:
//!     3306: {provider: aws, node_type: RESOURCE}
//!   default: {provider: ssh, node_type: COMPUTE}
//! service_name_filter:
//!   not: [sandbox]
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use types::{
    Hint, NodeType, Protocol, PROTOCOL_HINT, PROTOCOL_INVENTORY, PROTOCOL_SEED, PROVIDER_HINT,
    PROVIDER_INVENTORY, PROVIDER_SEED, PROVIDER_SSH,
};

use crate::error::CatalogError;
use crate::network::NetworkCatalog;

/// The (provider, node type) pair assigned to a discovered child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAssignment {
    pub provider: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressMatch {
    pub pattern: String,
    #[serde(flatten)]
    pub assignment: ChildAssignment,
}

/// How a strategy assigns providers to the children it discovers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildProviderRule {
    /// One assignment for every child.
    #[serde(rename = "matchAll")]
    MatchAll { provider: ChildAssignment },
    /// Exact integer match on the mux, with a fallback.
    #[serde(rename = "matchPort")]
    MatchPort {
        matches: BTreeMap<u16, ChildAssignment>,
        default: ChildAssignment,
    },
    /// First regex (in declaration order) matching the address wins.
    #[serde(rename = "matchAddress")]
    MatchAddress {
        matches: Vec<AddressMatch>,
        default: ChildAssignment,
    },
}

impl ChildProviderRule {
    /// Compile-check every pattern so a malformed rule fails at load time.
    fn validate(&self) -> Result<(), CatalogError> {
        if let ChildProviderRule::MatchAddress { matches, .. } = self {
            for m in matches {
                Regex::new(&m.pattern).map_err(|e| CatalogError::InvalidAddressPattern {
                    pattern: m.pattern.clone(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNameFilter {
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub not: Vec<String>,
}

/// An immutable, declarative profile strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStrategy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub protocol: Protocol,
    /// Provider refs allowed to execute this strategy.
    pub providers: Vec<String>,
    /// Opaque arguments passed through to the provider.
    #[serde(default)]
    pub provider_args: BTreeMap<String, serde_yaml::Value>,
    pub child_provider: ChildProviderRule,
    #[serde(default)]
    pub service_name_filter: ServiceNameFilter,
}

impl ProfileStrategy {
    /// True means this service name should NOT be profiled by this strategy.
    pub fn filter_service_name(&self, service_name: &str) -> bool {
        let filter = &self.service_name_filter;
        if filter.not.iter().any(|n| n == service_name) {
            return true;
        }
        if !filter.only.is_empty() && !filter.only.iter().any(|o| o == service_name) {
            return true;
        }
        false
    }

    /// Resolve the (provider, node type) for a child discovered with this
    /// strategy. Deterministic; a malformed rule surfaces as an error the
    /// engine treats as fatal.
    pub fn determine_child_provider(
        &self,
        protocol_mux: &str,
        address: Option<&str>,
    ) -> Result<ChildAssignment, CatalogError> {
        match &self.child_provider {
            ChildProviderRule::MatchAll { provider } => Ok(provider.clone()),
            ChildProviderRule::MatchPort { matches, default } => {
                let assignment = protocol_mux
                    .parse::<u16>()
                    .ok()
                    .and_then(|port| matches.get(&port))
                    .unwrap_or(default);
                Ok(assignment.clone())
            }
            ChildProviderRule::MatchAddress { matches, default } => {
                let address = address.unwrap_or("");
                for m in matches {
                    let re = Regex::new(&m.pattern).map_err(|e| {
                        CatalogError::InvalidAddressPattern {
                            pattern: m.pattern.clone(),
                            source: e,
                        }
                    })?;
                    if re.is_match(address) {
                        return Ok(m.assignment.clone());
                    }
                }
                Ok(default.clone())
            }
        }
    }

    /// Whether children of this strategy originate from a hint.
    pub fn is_hint(&self) -> bool {
        self.providers.iter().any(|p| p == PROVIDER_HINT)
    }
}

pub static SEED_PROFILE_STRATEGY: Lazy<ProfileStrategy> = Lazy::new(|| ProfileStrategy {
    name: "Seed".to_string(),
    description: "seed nodes supplied on the command line".to_string(),
    protocol: PROTOCOL_SEED.clone(),
    providers: vec![PROVIDER_SEED.to_string()],
    provider_args: BTreeMap::new(),
    child_provider: ChildProviderRule::MatchAll {
        provider: ChildAssignment {
            provider: PROVIDER_SSH.to_string(),
            node_type: NodeType::Compute,
        },
    },
    service_name_filter: ServiceNameFilter::default(),
});

pub static INVENTORY_PROFILE_STRATEGY: Lazy<ProfileStrategy> = Lazy::new(|| ProfileStrategy {
    name: "Inventory".to_string(),
    description: "nodes created by provider inventory".to_string(),
    protocol: PROTOCOL_INVENTORY.clone(),
    providers: vec![PROVIDER_INVENTORY.to_string()],
    provider_args: BTreeMap::new(),
    child_provider: ChildProviderRule::MatchAll {
        provider: ChildAssignment {
            provider: PROVIDER_SSH.to_string(),
            node_type: NodeType::Compute,
        },
    },
    service_name_filter: ServiceNameFilter::default(),
});

pub static HINT_DISCOVERY_STRATEGY: Lazy<ProfileStrategy> = Lazy::new(|| ProfileStrategy {
    name: "Hint".to_string(),
    description: "statically declared edges".to_string(),
    protocol: PROTOCOL_HINT.clone(),
    providers: vec![PROVIDER_HINT.to_string()],
    provider_args: BTreeMap::new(),
    child_provider: ChildProviderRule::MatchAll {
        provider: ChildAssignment {
            provider: PROVIDER_SSH.to_string(),
            node_type: NodeType::Compute,
        },
    },
    service_name_filter: ServiceNameFilter::default(),
});

/// The synthetic strategy a hint task runs under: the hint pseudo-strategy
/// re-bound to the hint's protocol and declared child provider.
pub fn hint_strategy(hint: &Hint) -> ProfileStrategy {
    ProfileStrategy {
        protocol: hint.protocol.clone(),
        child_provider: ChildProviderRule::MatchAll {
            provider: ChildAssignment {
                provider: hint.provider.clone(),
                node_type: NodeType::Compute,
            },
        },
        ..HINT_DISCOVERY_STRATEGY.clone()
    }
}

#[derive(Debug, Deserialize)]
struct RawStrategy {
    name: String,
    #[serde(default)]
    description: String,
    protocol: String,
    providers: Vec<String>,
    #[serde(default)]
    provider_args: BTreeMap<String, serde_yaml::Value>,
    child_provider: ChildProviderRule,
    #[serde(default)]
    service_name_filter: ServiceNameFilter,
}

/// All loaded strategies for a run.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: Vec<ProfileStrategy>,
}

impl StrategyRegistry {
    /// Load every `type: ProfileStrategy` document from the given YAML
    /// files, resolving protocol refs against the catalog.
    pub fn load<P: AsRef<Path>>(
        files: &[P],
        catalog: &NetworkCatalog,
    ) -> Result<Self, CatalogError> {
        let mut registry = Self::default();
        for file in files {
            let path = file.as_ref();
            let text =
                std::fs::read_to_string(path).map_err(|e| CatalogError::io(path.to_owned(), e))?;
            for document in serde_yaml::Deserializer::from_str(&text) {
                let value = serde_yaml::Value::deserialize(document)
                    .map_err(|e| CatalogError::parse(path.to_owned(), e))?;
                if value.get("type").and_then(|t| t.as_str()) != Some("ProfileStrategy") {
                    continue;
                }
                let raw: RawStrategy = serde_yaml::from_value(value)
                    .map_err(|e| CatalogError::parse(path.to_owned(), e))?;
                registry.add(raw, catalog)?;
            }
        }
        Ok(registry)
    }

    fn add(&mut self, raw: RawStrategy, catalog: &NetworkCatalog) -> Result<(), CatalogError> {
        let protocol = catalog.protocol(&raw.protocol)?.clone();
        raw.child_provider.validate()?;
        let strategy = ProfileStrategy {
            name: raw.name,
            description: raw.description,
            protocol,
            providers: raw.providers,
            provider_args: raw.provider_args,
            child_provider: raw.child_provider,
            service_name_filter: raw.service_name_filter,
        };
        debug!(strategy = %strategy.name, "loaded profile strategy");
        self.strategies.push(strategy);
        Ok(())
    }

    pub fn strategies(&self) -> &[ProfileStrategy] {
        &self.strategies
    }

    /// Strategies a given provider should run for a given service name.
    pub fn applicable<'a>(
        &'a self,
        provider_ref: &'a str,
        service_name: &'a str,
        skip_protocols: &'a [String],
    ) -> impl Iterator<Item = &'a ProfileStrategy> {
        self.strategies.iter().filter(move |s| {
            s.providers.iter().any(|p| p == provider_ref)
                && !skip_protocols.contains(&s.protocol.ref_)
                && !s.filter_service_name(service_name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn assignment(provider: &str, node_type: NodeType) -> ChildAssignment {
        ChildAssignment {
            provider: provider.to_string(),
            node_type,
        }
    }

    fn strategy_with_rule(rule: ChildProviderRule) -> ProfileStrategy {
        ProfileStrategy {
            name: "stub".to_string(),
            description: String::new(),
            protocol: types::PROTOCOL_TCP.clone(),
            providers: vec!["ssh".to_string()],
            provider_args: BTreeMap::new(),
            child_provider: rule,
            service_name_filter: ServiceNameFilter::default(),
        }
    }

    #[test]
    fn filter_service_name_not_and_only() {
        let mut strategy = strategy_with_rule(ChildProviderRule::MatchAll {
            provider: assignment("ssh", NodeType::Compute),
        });
        strategy.service_name_filter = ServiceNameFilter {
            only: vec![],
            not: vec!["bad-svc".to_string()],
        };
        assert!(strategy.filter_service_name("bad-svc"));
        assert!(!strategy.filter_service_name("good-svc"));

        strategy.service_name_filter = ServiceNameFilter {
            only: vec!["good-svc".to_string()],
            not: vec![],
        };
        assert!(!strategy.filter_service_name("good-svc"));
        assert!(strategy.filter_service_name("other-svc"));
    }

    #[test]
    fn match_all_ignores_inputs() {
        let strategy = strategy_with_rule(ChildProviderRule::MatchAll {
            provider: assignment("k8s", NodeType::Deployment),
        });
        let got = strategy.determine_child_provider("anything", None).unwrap();
        assert_eq!(got, assignment("k8s", NodeType::Deployment));
    }

    #[test]
    fn match_port_requires_exact_integer_equality() {
        let mut matches = BTreeMap::new();
        matches.insert(3306u16, assignment("aws", NodeType::Resource));
        let strategy = strategy_with_rule(ChildProviderRule::MatchPort {
            matches,
            default: assignment("ssh", NodeType::Compute),
        });
        assert_eq!(
            strategy.determine_child_provider("3306", None).unwrap(),
            assignment("aws", NodeType::Resource)
        );
        assert_eq!(
            strategy.determine_child_provider("3307", None).unwrap(),
            assignment("ssh", NodeType::Compute)
        );
        // non-numeric falls back to default
        assert_eq!(
            strategy
                .determine_child_provider("orders:consume", None)
                .unwrap(),
            assignment("ssh", NodeType::Compute)
        );
    }

    #[test]
    fn match_address_first_declared_regex_wins() {
        let strategy = strategy_with_rule(ChildProviderRule::MatchAddress {
            matches: vec![
                AddressMatch {
                    pattern: "^10\\.".to_string(),
                    assignment: assignment("ssh", NodeType::Compute),
                },
                AddressMatch {
                    pattern: "^10\\.0\\.".to_string(),
                    assignment: assignment("k8s", NodeType::Deployment),
                },
            ],
            default: assignment("aws", NodeType::Unknown),
        });
        // both patterns match; declaration order decides
        assert_eq!(
            strategy
                .determine_child_provider("443", Some("10.0.0.7"))
                .unwrap(),
            assignment("ssh", NodeType::Compute)
        );
        assert_eq!(
            strategy
                .determine_child_provider("443", Some("172.16.0.1"))
                .unwrap(),
            assignment("aws", NodeType::Unknown)
        );
        assert_eq!(
            strategy.determine_child_provider("443", None).unwrap(),
            assignment("aws", NodeType::Unknown)
        );
    }

    #[test]
    fn hint_strategy_binds_protocol_and_provider() {
        let hint = Hint {
            service_name: "svc-a".to_string(),
            protocol: Protocol::new("NSQ", "NSQ", false, false),
            protocol_mux: "orders:consume".to_string(),
            provider: "ssh".to_string(),
            instance_provider: "aws".to_string(),
        };
        let strategy = hint_strategy(&hint);
        assert_eq!(strategy.name, "Hint");
        assert!(strategy.is_hint());
        assert_eq!(strategy.protocol.ref_, "NSQ");
        assert_eq!(
            strategy.determine_child_provider("x", None).unwrap(),
            assignment("ssh", NodeType::Compute)
        );
    }

    #[test]
    fn loads_strategy_documents_from_yaml() {
        let dir = tempdir().unwrap();
        let network = dir.path().join("network.yaml");
        fs::write(&network, "protocols:\n  NSQ: {name: NSQ, blocking: false}\n").unwrap();
        let catalog = NetworkCatalog::load(&[&network]).unwrap();

        let strategies = dir.path().join("strategies.yaml");
        fs::write(
            &strategies,
            r#"
type: ProfileStrategy
name: netstat
protocol: TCP
providers: [ssh]
provider_args:
  shell_command: "netstat-parse"
child_provider:
  type: matchAll
  provider: {provider: ssh, node_type: COMPUTE}
---
type: SomethingElse
ignored: true
---
type: ProfileStrategy
name: nsq-topics
protocol: NSQ
providers: [hnt]
child_provider:
  type: matchAll
  provider: {provider: ssh, node_type: COMPUTE}
"#,
        )
        .unwrap();

        let registry = StrategyRegistry::load(&[&strategies], &catalog).unwrap();
        assert_eq!(registry.strategies().len(), 2);
        assert_eq!(registry.strategies()[0].name, "netstat");
        assert!(registry.strategies()[1].is_hint());

        let applicable: Vec<_> = registry.applicable("ssh", "svc-a", &[]).collect();
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].name, "netstat");

        let excluded = ["TCP".to_string()];
        let skipped: Vec<_> = registry.applicable("ssh", "svc-a", &excluded).collect();
        assert!(skipped.is_empty());
    }

    #[test]
    fn malformed_address_rule_fails_load() {
        let dir = tempdir().unwrap();
        let network = dir.path().join("network.yaml");
        fs::write(&network, "protocols:\n  NSQ: {name: NSQ, blocking: false}\n").unwrap();
        let catalog = NetworkCatalog::load(&[&network]).unwrap();

        let strategies = dir.path().join("strategies.yaml");
        fs::write(
            &strategies,
            r#"
type: ProfileStrategy
name: broken
protocol: TCP
providers: [ssh]
child_provider:
  type: matchAddress
  matches:
    - pattern: "["
      provider: ssh
      node_type: COMPUTE
  default: {provider: ssh, node_type: COMPUTE}
"#,
        )
        .unwrap();

        let err = StrategyRegistry::load(&[&strategies], &catalog).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidAddressPattern { .. }));
    }
}
