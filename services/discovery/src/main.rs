//! `sextant`: recursive network-topology discovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use catalog::{NetworkCatalog, StrategyRegistry};
use discovery_service::cli::{Cli, Commands, DiscoverArgs, ExportArgs};
use discovery_service::export::{export_json, export_tree, AsciiOptions};
use discovery_service::providers::ProcProvider;
use discovery_service::snapshot::{Snapshot, LASTRUN_FILE};
use discovery_service::{DiscoveryEngine, DiscoverySettings, ProviderRegistry};
use graph::MemoryGraph;
use types::Tree;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Discover(args) => discover(args).await,
        Commands::Export(args) => export(args).await,
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn discover(args: DiscoverArgs) -> Result<()> {
    init_tracing(args.debug);
    let settings = args.to_settings();

    std::fs::create_dir_all(&args.outputs_dir)
        .with_context(|| format!("creating outputs dir {}", args.outputs_dir.display()))?;

    let network_file = args.catalog_dir.join("network.yaml");
    if !network_file.exists() {
        bail!(
            "no network catalog at {}; create it before discovering",
            network_file.display()
        );
    }
    let mut catalog = NetworkCatalog::load(&[&network_file])?;
    catalog.extend_skip_protocol_muxes(settings.skip_protocol_muxes.clone());
    let strategy_files = yaml_files(&args.catalog_dir)?;
    let strategies = StrategyRegistry::load(&strategy_files, &catalog)?;
    info!(
        strategies = strategies.strategies().len(),
        "loaded catalog and strategies"
    );

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(ProcProvider::new(args.proc_name_command.clone())))?;
    for (ref_, permits) in &settings.provider_concurrency {
        providers.set_concurrency(ref_, *permits);
    }

    let graph = Arc::new(MemoryGraph::new());
    let engine = DiscoveryEngine::new(
        settings.clone(),
        catalog,
        strategies,
        providers,
        graph.clone(),
    );

    engine.perform_inventory().await?;
    let tree = engine.seed_tree()?;

    if settings.quiet {
        engine.run(tree.clone()).await?;
    } else {
        let options = ascii_options(&settings);
        let live_tree = tree.clone();
        let (run_result, _) = tokio::join!(engine.run(tree.clone()), async move {
            let mut err = std::io::stderr();
            if let Err(e) = export_tree(&live_tree, &mut err, &options).await {
                tracing::warn!(error = %e, "live export failed");
            }
        });
        run_result?;
    }

    Snapshot::capture(&settings, &tree).dump(args.outputs_dir.join(LASTRUN_FILE))?;
    info!(nodes = graph.len(), "discovery complete");

    for exporter in &args.output {
        run_exporter(exporter, &settings, &tree).await?;
    }
    Ok(())
}

async fn export(args: ExportArgs) -> Result<()> {
    init_tracing(args.debug);

    let path = args
        .snapshot_file
        .clone()
        .unwrap_or_else(|| args.outputs_dir.join(LASTRUN_FILE));
    let snapshot = Snapshot::load(&path)?;
    let (mut settings, tree) = snapshot.restore();
    settings.hide_defunct |= args.hide_defunct;

    let outputs = if args.output.is_empty() {
        vec!["ascii".to_string()]
    } else {
        args.output.clone()
    };
    for exporter in &outputs {
        run_exporter(exporter, &settings, &tree).await?;
    }
    Ok(())
}

async fn run_exporter(exporter: &str, settings: &DiscoverySettings, tree: &Tree) -> Result<()> {
    match exporter {
        "ascii" => {
            let mut out = std::io::stdout();
            export_tree(tree, &mut out, &ascii_options(settings)).await?;
        }
        "json" => {
            let mut out = std::io::stdout();
            export_json(settings, tree, &mut out)?;
        }
        other => bail!("unknown exporter: {other:?} (expected \"ascii\" or \"json\")"),
    }
    Ok(())
}

fn ascii_options(settings: &DiscoverySettings) -> AsciiOptions {
    AsciiOptions {
        hide_defunct: settings.hide_defunct,
        max_depth: settings.max_depth,
        ..AsciiOptions::default()
    }
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading catalog dir {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "yaml").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}
