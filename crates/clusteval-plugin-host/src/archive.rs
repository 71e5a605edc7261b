use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use clusteval_plugin_sdk::{CapabilityFactory, CapabilityKind};
use clusteval_registry::CapabilityRegistry;

use crate::LoadError;

/// A candidate plugin file together with the name it is expected to provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArchive {
    pub path: PathBuf,
    pub kind: CapabilityKind,
    /// Implementation name derived from the file name.
    pub name: String,
    pub modified: SystemTime,
}

impl PluginArchive {
    pub fn inspect(kind: CapabilityKind, path: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let path = path.into();
        let name = kind
            .name_from_file(&path)
            .ok_or_else(|| LoadError::NameConvention {
                path: path.clone(),
                suffix: kind.suffix(),
            })?;
        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(|err| LoadError::io(&path, err))?;
        Ok(Self {
            path,
            kind,
            name,
            modified,
        })
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One implementation extracted from an archive.
#[derive(Clone)]
pub struct LoadedCapability {
    /// Name to bind in the registry.
    pub name: String,
    pub factory: Arc<dyn CapabilityFactory>,
}

impl fmt::Debug for LoadedCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedCapability")
            .field("name", &self.name)
            .finish()
    }
}

/// Turns one archive into capability factories.
///
/// Loaders never touch the registry except to check requirements; the caller
/// decides how the result is installed.
pub trait ArchiveLoader: Send + Sync {
    fn load(
        &self,
        archive: &PluginArchive,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<LoadedCapability>, LoadError>;
}
