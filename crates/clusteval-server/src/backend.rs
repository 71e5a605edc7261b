use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clusteval_plugin_host::{BuiltinCatalog, CompositeLoader, DylibLoader, ManifestLoader};
use clusteval_plugin_scanner::{CapabilityFinder, DiscoveryLoop, RemovalPolicy, Supervisor};
use clusteval_registry::CapabilityRegistry;
use clusteval_rengine::{DisabledEngineFactory, EngineFactory, RProcessFactory, SessionPool};
use clusteval_run::{ResultStore, RunCatalog, RunFinder};
use clusteval_scheduler::{ProgramExecutor, Scheduler};
use tracing::{info, warn};

use crate::config::{ServerConfig, CONFIG_FILE_NAME};
use crate::facade::ControlFacade;
use crate::logging::LogControl;

/// Directories of a repository, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLayout {
    pub root: PathBuf,
    pub plugins: PathBuf,
    pub runs: PathBuf,
    pub results: PathBuf,
}

impl RepositoryLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            plugins: root.join("plugins"),
            runs: root.join("runs"),
            results: root.join("results"),
            root,
        }
    }

    /// Private copies of loaded plugin libraries.
    pub fn shadow_dir(&self) -> PathBuf {
        self.plugins.join(".shadow")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.plugins, &self.runs, &self.results] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Files that could not be loaded after discovery settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub failed: Vec<(PathBuf, String)>,
    pub postponed: Vec<PathBuf>,
}

/// Runs every loop until a full pass changes nothing, so capabilities that
/// require other kinds end up registered regardless of loop order.
pub fn scan_until_settled(loops: &[DiscoveryLoop]) -> ScanSummary {
    loop {
        let mut changed = false;
        let mut summary = ScanSummary::default();
        for discovery in loops {
            let report = discovery.run_once();
            changed |= report.changed();
            summary.failed.extend(report.failed);
            summary.postponed.extend(report.postponed);
        }
        if !changed {
            return summary;
        }
    }
}

/// One discovery loop per capability kind plus the run-definition loop.
pub fn discovery_loops(
    layout: &RepositoryLayout,
    registry: &Arc<CapabilityRegistry>,
    runs: &Arc<RunCatalog>,
) -> Vec<DiscoveryLoop> {
    let loader = Arc::new(CompositeLoader::new(
        ManifestLoader::new(Arc::new(BuiltinCatalog::standard())),
        DylibLoader::new(layout.shadow_dir()),
    ));
    let mut loops: Vec<DiscoveryLoop> =
        CapabilityFinder::for_all_kinds(&layout.plugins, loader, Arc::clone(registry))
            .into_iter()
            .map(|finder| DiscoveryLoop::new(Arc::new(finder)))
            .collect();
    loops.push(
        DiscoveryLoop::new(Arc::new(RunFinder::new(&layout.runs, Arc::clone(runs))))
            .with_policy(RemovalPolicy::Purge),
    );
    loops
}

pub fn engine_factory(config: &ServerConfig) -> Arc<dyn EngineFactory> {
    if config.engine.enabled {
        Arc::new(RProcessFactory::new(
            config.engine.command.clone(),
            config.engine.args.clone(),
        ))
    } else {
        info!("engine disabled, scripts cannot be evaluated");
        Arc::new(DisabledEngineFactory)
    }
}

/// A running backend: discovery supervisor, scheduler and control facade.
pub struct Backend {
    layout: RepositoryLayout,
    supervisor: Option<Supervisor>,
    facade: Arc<ControlFacade>,
}

impl Backend {
    pub fn start(
        layout: RepositoryLayout,
        config: &ServerConfig,
        log: Option<LogControl>,
    ) -> anyhow::Result<Self> {
        let engine = engine_factory(config);
        Self::start_with_engine(layout, config, log, engine)
    }

    pub fn start_with_engine(
        layout: RepositoryLayout,
        config: &ServerConfig,
        log: Option<LogControl>,
        engine: Arc<dyn EngineFactory>,
    ) -> anyhow::Result<Self> {
        layout
            .create_dirs()
            .with_context(|| format!("failed to prepare repository {}", layout.root.display()))?;

        let registry = Arc::new(CapabilityRegistry::new());
        let runs = Arc::new(RunCatalog::new());
        let loops = discovery_loops(&layout, &registry, &runs);
        let summary = scan_until_settled(&loops);
        for (path, error) in &summary.failed {
            warn!(path = %path.display(), %error, "plugin not loaded");
        }
        info!(
            capabilities = registry.len(),
            runs = runs.len(),
            failed = summary.failed.len(),
            "initial discovery finished"
        );
        let supervisor = Supervisor::start(loops, &config.sleep_times);

        let scheduler = Scheduler::start(
            config.scheduler.clone(),
            registry,
            runs,
            ResultStore::new(&layout.results),
            Arc::new(SessionPool::new(engine)),
            Arc::new(ProgramExecutor),
        );
        let facade = Arc::new(ControlFacade::new(
            Arc::new(scheduler),
            log,
            config.server.admin_client_id.clone(),
        ));
        Ok(Self {
            layout,
            supervisor: Some(supervisor),
            facade,
        })
    }

    pub fn layout(&self) -> &RepositoryLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    pub fn facade(&self) -> &Arc<ControlFacade> {
        &self.facade
    }

    /// Stops discovery. The scheduler stops through the facade's shutdown
    /// or when the last reference to it is dropped.
    pub fn stop(mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown();
        }
    }
}
