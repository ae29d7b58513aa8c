//! Command-line interface for the `sextant` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::settings::DiscoverySettings;

#[derive(Debug, Parser)]
#[command(
    name = "sextant",
    about = "Discover the network topology of a microservice fleet",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Crawl a network of services from seed endpoints
    Discover(DiscoverArgs),
    /// Export the results of a previous discover
    Export(ExportArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DiscoverArgs {
    /// Seed endpoint(s) in "provider:address" form, e.g. "ssh:10.0.0.42"
    #[arg(short, long, required = true, num_args = 1.., value_name = "SEED")]
    pub seeds: Vec<String>,

    /// Per-call provider timeout, seconds
    #[arg(short, long, default_value_t = 60, value_name = "SECONDS")]
    pub timeout: u64,

    /// Max tree depth to discover
    #[arg(short = 'd', long, default_value_t = 100, value_name = "DEPTH")]
    pub max_depth: usize,

    /// Do not initialize or discover with these providers
    #[arg(short = 'X', long, num_args = 1.., value_name = "PROVIDER")]
    pub disable_providers: Vec<String>,

    /// Protocols whose strategies are not run, e.g. "NSQ PXY"
    #[arg(short = 'P', long, num_args = 1.., value_name = "PROTOCOL")]
    pub skip_protocols: Vec<String>,

    /// Muxes (substring match) whose nodes are not connected to and whose
    /// children are dropped
    #[arg(short = 'M', long, num_args = 1.., value_name = "MUX")]
    pub skip_protocol_muxes: Vec<String>,

    /// Skip profiling of nonblocking services below the seeds' children
    #[arg(short = 'G', long)]
    pub skip_nonblocking_grandchildren: bool,

    /// Obfuscate service names and muxes for sharing outside trusted
    /// organizations
    #[arg(short = 'x', long)]
    pub obfuscate: bool,

    /// Hide defunct (unused) connections in exports
    #[arg(short = 'D', long)]
    pub hide_defunct: bool,

    /// Do not render the live tree to stderr while discovering
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Skip provider inventory and discover from seeds alone
    #[arg(long)]
    pub seeds_only: bool,

    /// Skip provider inventory
    #[arg(long)]
    pub skip_inventory: bool,

    /// Per-provider concurrency bound, repeatable, e.g. "ssh=10"
    #[arg(long, value_parser = parse_provider_concurrency, value_name = "REF=N")]
    pub provider_concurrency: Vec<(String, usize)>,

    /// Name command run by the proc provider to resolve the local service
    #[arg(long, default_value = "hostname", value_name = "COMMAND")]
    pub proc_name_command: String,

    /// Directory holding network.yaml and profile-strategy files
    #[arg(short = 'c', long, default_value = "sextant.d", value_name = "DIR")]
    pub catalog_dir: PathBuf,

    /// Directory for run outputs (last-run snapshot)
    #[arg(long, default_value = "outputs", value_name = "DIR")]
    pub outputs_dir: PathBuf,

    /// Exporters to run after discovery: "ascii", "json"
    #[arg(short = 'o', long, num_args = 1.., value_name = "EXPORTER")]
    pub output: Vec<String>,

    /// Log debug output to stderr
    #[arg(long)]
    pub debug: bool,
}

impl DiscoverArgs {
    pub fn to_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            seeds: self.seeds.clone(),
            timeout: self.timeout,
            max_depth: self.max_depth,
            disable_providers: self.disable_providers.clone(),
            skip_protocols: self.skip_protocols.clone(),
            skip_protocol_muxes: self.skip_protocol_muxes.clone(),
            skip_nonblocking_grandchildren: self.skip_nonblocking_grandchildren,
            obfuscate: self.obfuscate,
            hide_defunct: self.hide_defunct,
            quiet: self.quiet,
            seeds_only: self.seeds_only,
            skip_inventory: self.skip_inventory,
            provider_concurrency: self.provider_concurrency.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExportArgs {
    /// Load this snapshot instead of the last run's
    #[arg(short = 'f', long, value_name = "FILE")]
    pub snapshot_file: Option<PathBuf>,

    /// Exporters to run: "ascii", "json" (default ascii)
    #[arg(short = 'o', long, num_args = 1.., value_name = "EXPORTER")]
    pub output: Vec<String>,

    /// Hide defunct (unused) connections
    #[arg(short = 'D', long)]
    pub hide_defunct: bool,

    /// Directory for run outputs (last-run snapshot)
    #[arg(long, default_value = "outputs", value_name = "DIR")]
    pub outputs_dir: PathBuf,

    /// Log debug output to stderr
    #[arg(long)]
    pub debug: bool,
}

fn parse_provider_concurrency(raw: &str) -> Result<(String, usize), String> {
    let (ref_, permits) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected REF=N, got {raw:?}"))?;
    let permits: usize = permits
        .parse()
        .map_err(|e| format!("invalid concurrency in {raw:?}: {e}"))?;
    Ok((ref_.to_string(), permits))
}
