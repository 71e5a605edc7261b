use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clusteval_plugin_scanner::{Finder, ScanError};
use clusteval_registry::{ObjectStore, Registered};
use tracing::warn;

use crate::RunDefinition;

pub const RUN_FILE_SUFFIX: &str = ".run.json";
pub const RUN_FINDER_NAME: &str = "RunFinderThread";

/// Run definitions currently present in the repository, keyed by file.
#[derive(Debug, Default)]
pub struct RunCatalog {
    store: ObjectStore<RunDefinition>,
}

impl RunCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, definition: RunDefinition) -> bool {
        self.store.register(path, definition)
    }

    pub fn remove(&self, path: &Path) -> Option<String> {
        let name = self.store.get(path).map(|object| object.value().name.clone());
        self.store.unregister(path);
        name
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Registered<RunDefinition>>> {
        self.store.find(|definition| definition.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .all()
            .iter()
            .map(|object| object.value().name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Keeps a [`RunCatalog`] in sync with the `*.run.json` files below a
/// directory.
pub struct RunFinder {
    root: PathBuf,
    catalog: Arc<RunCatalog>,
}

impl RunFinder {
    pub fn new(root: impl Into<PathBuf>, catalog: Arc<RunCatalog>) -> Self {
        Self {
            root: root.into(),
            catalog,
        }
    }
}

impl Finder for RunFinder {
    fn name(&self) -> String {
        RUN_FINDER_NAME.into()
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.ends_with(RUN_FILE_SUFFIX) && name.len() > RUN_FILE_SUFFIX.len()
            })
    }

    fn load(&self, path: &Path) -> Result<Vec<String>, ScanError> {
        let text = fs::read_to_string(path).map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let definition: RunDefinition =
            serde_json::from_str(&text).map_err(|err| ScanError::Invalid {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        if definition.name.trim().is_empty() {
            return Err(ScanError::Invalid {
                path: path.to_path_buf(),
                message: "run name is empty".into(),
            });
        }
        if let Some(other) = self.catalog.by_name(&definition.name) {
            if other.path() != path {
                warn!(
                    run = %definition.name,
                    path = %path.display(),
                    other = %other.path().display(),
                    "run name defined twice"
                );
            }
        }
        let name = definition.name.clone();
        self.catalog.insert(path, definition);
        Ok(vec![name])
    }

    fn forget(&self, path: &Path) -> Vec<String> {
        self.catalog.remove(path).into_iter().collect()
    }
}
