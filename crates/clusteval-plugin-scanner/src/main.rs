use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clusteval_plugin_host::{BuiltinCatalog, CompositeLoader};
use clusteval_plugin_scanner::{CapabilityFinder, DiscoveryLoop};
use clusteval_plugin_sdk::CapabilityKind;
use clusteval_registry::CapabilityRegistry;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "clusteval-plugin-scanner")]
struct Args {
    /// Repository root containing the `plugins` directory
    #[arg(long, default_value = ".")]
    repository: PathBuf,

    /// Restrict scanning to the given capability kinds
    #[arg(long = "kind", value_name = "KIND")]
    kinds: Vec<CapabilityKind>,

    /// Print the registry as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init()
        .ok();

    let args = Args::parse();
    let plugin_root = args.repository.join("plugins");
    let registry = Arc::new(CapabilityRegistry::new());
    let loader = Arc::new(CompositeLoader::with_catalog(Arc::new(BuiltinCatalog::standard())));

    let finders = CapabilityFinder::for_all_kinds(&plugin_root, loader, Arc::clone(&registry));
    let loops: Vec<DiscoveryLoop> = finders
        .into_iter()
        .filter(|finder| args.kinds.is_empty() || args.kinds.contains(&finder.kind()))
        .map(|finder| DiscoveryLoop::new(Arc::new(finder)))
        .collect();

    // Requirements may cross kinds, so repeat until a pass changes nothing.
    let mut failures = Vec::new();
    loop {
        let mut changed = false;
        let mut postponed = Vec::new();
        for discovery in &loops {
            let report = discovery.run_once();
            changed |= report.changed();
            failures.extend(report.failed);
            postponed.extend(report.postponed);
        }
        if !changed {
            for path in postponed {
                eprintln!("unsatisfied requirements: {}", path.display());
            }
            break;
        }
    }
    for (path, error) in &failures {
        eprintln!("failed: {} ({error})", path.display());
    }

    let snapshot = registry.snapshot();
    if args.json {
        let json = serde_json::to_string_pretty(&snapshot).context("failed to encode registry")?;
        println!("{json}");
    } else {
        for binding in snapshot {
            let source = binding
                .source
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "built-in".into());
            println!("{}/{} ({source})", binding.kind, binding.name);
        }
    }
    Ok(())
}
