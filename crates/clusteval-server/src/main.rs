use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clusteval_registry::CapabilityRegistry;
use clusteval_run::RunCatalog;
use clusteval_server::{
    discovery_loops, scan_until_settled, Backend, LogControl, RepositoryLayout, RpcServer,
    ServerConfig,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "clusteval-server", about = "Clustering evaluation backend server")]
struct Args {
    /// Repository root containing `plugins`, `runs` and `results`
    #[arg(long, default_value = ".")]
    repository: PathBuf,

    /// Configuration file (defaults to `<repository>/repository.config`)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding `[server] bind`
    #[arg(long)]
    bind: Option<String>,

    /// Worker threads, overriding `[scheduler] workers`
    #[arg(long)]
    workers: Option<usize>,

    /// Initial log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Scan the repository once, report what loaded and exit
    #[arg(long)]
    check_once: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = LogControl::init(&args.log_level)?;

    let layout = RepositoryLayout::new(&args.repository);
    let config_path = args.config.clone().unwrap_or_else(|| layout.config_file());
    let mut config = ServerConfig::load_from(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(workers) = args.workers {
        config.scheduler = config.scheduler.with_workers(workers);
    }

    if args.check_once {
        return check_once(&layout);
    }

    let backend = Backend::start(layout, &config, Some(log))?;
    let server = RpcServer::bind(config.server.bind.as_str(), Arc::clone(backend.facade()))
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    server.serve().context("control server failed")?;
    backend.stop();
    info!("backend stopped");
    Ok(())
}

fn check_once(layout: &RepositoryLayout) -> anyhow::Result<()> {
    let registry = Arc::new(CapabilityRegistry::new());
    let runs = Arc::new(RunCatalog::new());
    let summary = scan_until_settled(&discovery_loops(layout, &registry, &runs));

    for binding in registry.snapshot() {
        let source = binding
            .source
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "built-in".into());
        println!("{}/{} ({source})", binding.kind, binding.name);
    }
    for run in runs.names() {
        println!("Run/{run}");
    }
    for path in &summary.postponed {
        eprintln!("unsatisfied requirements: {}", path.display());
    }
    for (path, error) in &summary.failed {
        eprintln!("failed: {} ({error})", path.display());
    }
    if summary.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} file(s) failed to load", summary.failed.len())
    }
}
