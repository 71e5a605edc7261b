use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clusteval_plugin_host::{ArchiveLoader, PluginArchive};
use clusteval_plugin_sdk::CapabilityKind;
use clusteval_registry::CapabilityRegistry;
use tracing::debug;

use crate::ScanError;

/// Something a [`DiscoveryLoop`](crate::DiscoveryLoop) can keep in sync with a
/// directory tree.
pub trait Finder: Send + Sync {
    /// Loop name; also the prefix of its `SleepTime` configuration key.
    fn name(&self) -> String;
    fn root(&self) -> &Path;
    fn matches(&self, path: &Path) -> bool;
    /// Installs the object(s) found in `path`, replacing anything previously
    /// installed from it. Returns the installed names.
    fn load(&self, path: &Path) -> Result<Vec<String>, ScanError>;
    /// Drops whatever was installed from `path`. Returns the dropped names.
    fn forget(&self, path: &Path) -> Vec<String>;
}

/// Finds plugin archives of one capability kind and installs them into the
/// registry.
pub struct CapabilityFinder {
    kind: CapabilityKind,
    root: PathBuf,
    loader: Arc<dyn ArchiveLoader>,
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityFinder {
    pub fn new(
        kind: CapabilityKind,
        root: impl Into<PathBuf>,
        loader: Arc<dyn ArchiveLoader>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            kind,
            root: root.into(),
            loader,
            registry,
        }
    }

    /// One finder per capability kind below `plugin_root`.
    pub fn for_all_kinds(
        plugin_root: &Path,
        loader: Arc<dyn ArchiveLoader>,
        registry: Arc<CapabilityRegistry>,
    ) -> Vec<CapabilityFinder> {
        CapabilityKind::ALL
            .into_iter()
            .map(|kind| {
                CapabilityFinder::new(
                    kind,
                    plugin_root.join(kind.directory()),
                    Arc::clone(&loader),
                    Arc::clone(&registry),
                )
            })
            .collect()
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }
}

impl Finder for CapabilityFinder {
    fn name(&self) -> String {
        self.kind.loop_name()
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn matches(&self, path: &Path) -> bool {
        self.kind.name_from_file(path).is_some()
    }

    fn load(&self, path: &Path) -> Result<Vec<String>, ScanError> {
        let archive = PluginArchive::inspect(self.kind, path)?;
        let loaded = self.loader.load(&archive, &self.registry)?;

        let mut names = Vec::with_capacity(loaded.len());
        for capability in loaded {
            self.registry.register_from(
                self.kind,
                &capability.name,
                capability.factory,
                Some(path.to_path_buf()),
            );
            names.push(capability.name);
        }

        // A rewritten archive may no longer provide everything it used to.
        let current: HashSet<&str> = names.iter().map(String::as_str).collect();
        for stale in self
            .registry
            .list_by_kind(self.kind)
            .into_iter()
            .filter(|binding| binding.source.as_deref() == Some(path))
            .filter(|binding| !current.contains(binding.descriptor.name.as_str()))
        {
            debug!(
                kind = %self.kind,
                name = %stale.descriptor.name,
                "archive no longer provides capability"
            );
            self.registry.unregister(self.kind, &stale.descriptor.name);
        }
        Ok(names)
    }

    fn forget(&self, path: &Path) -> Vec<String> {
        self.registry
            .unregister_source(path)
            .into_iter()
            .map(|id| id.name)
            .collect()
    }
}
