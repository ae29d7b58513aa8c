//! Engine settings derived from the CLI.
//!
//! Serialized into the last-run snapshot so `sextant export` can restore
//! the knobs that shape the tree (`max_depth`,
//! `skip_nonblocking_grandchildren`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    pub seeds: Vec<String>,
    /// Per-call provider timeout, seconds.
    pub timeout: u64,
    pub max_depth: usize,
    pub disable_providers: Vec<String>,
    pub skip_protocols: Vec<String>,
    pub skip_protocol_muxes: Vec<String>,
    pub skip_nonblocking_grandchildren: bool,
    pub obfuscate: bool,
    pub hide_defunct: bool,
    pub quiet: bool,
    pub seeds_only: bool,
    pub skip_inventory: bool,
    /// Per-provider semaphore sizes, e.g. `ssh=10`.
    pub provider_concurrency: Vec<(String, usize)>,
}

impl DiscoverySettings {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            seeds: vec![],
            timeout: 60,
            max_depth: 100,
            disable_providers: vec![],
            skip_protocols: vec![],
            skip_protocol_muxes: vec![],
            skip_nonblocking_grandchildren: false,
            obfuscate: false,
            hide_defunct: false,
            quiet: false,
            seeds_only: false,
            skip_inventory: false,
            provider_concurrency: vec![],
        }
    }
}
