//! Sextant Discovery Service
//!
//! The recursive, concurrent discovery engine and everything it needs at
//! runtime: the provider abstraction and registry, the local-exec provider,
//! the obfuscator, snapshot persistence and the exporters. The `sextant`
//! binary wires these together behind the `discover` and `export` commands.

pub mod cli;
pub mod engine;
pub mod export;
pub mod obfuscate;
pub mod provider;
pub mod providers;
pub mod settings;
pub mod snapshot;

pub use engine::{DiscoveryEngine, FatalDiscoveryError};
pub use provider::{
    Provider, ProviderConnection, ProviderError, ProviderRegistry, RegistryError,
};
pub use settings::DiscoverySettings;
