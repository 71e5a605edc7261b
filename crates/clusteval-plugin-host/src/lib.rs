//! Turning plugin archives into capability factories.
//!
//! Two kinds of archive exist. Shared libraries (`.so`, `.dylib`, `.dll`)
//! export a `clusteval_plugin_entrypoint` and are opened with `libloading`.
//! Every other file is treated as a manifest: either empty, activating a
//! compiled-in factory of the same name, or a JSON document describing the
//! capability.

mod archive;
mod catalog;
mod dylib;
mod error;
mod manifest;

use std::sync::Arc;

use clusteval_registry::CapabilityRegistry;

pub use archive::{ArchiveLoader, LoadedCapability, PluginArchive};
pub use catalog::BuiltinCatalog;
pub use dylib::DylibLoader;
pub use error::LoadError;
pub use manifest::ManifestLoader;

const LIBRARY_EXTENSIONS: [&str; 3] = ["so", "dylib", "dll"];

/// Dispatches archives to the dynamic-library or manifest loader by extension.
pub struct CompositeLoader {
    manifest: ManifestLoader,
    dylib: DylibLoader,
}

impl CompositeLoader {
    pub fn new(manifest: ManifestLoader, dylib: DylibLoader) -> Self {
        Self { manifest, dylib }
    }

    pub fn with_catalog(catalog: Arc<BuiltinCatalog>) -> Self {
        Self::new(ManifestLoader::new(catalog), DylibLoader::default())
    }
}

impl ArchiveLoader for CompositeLoader {
    fn load(
        &self,
        archive: &PluginArchive,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<LoadedCapability>, LoadError> {
        let is_library = archive
            .extension()
            .is_some_and(|ext| LIBRARY_EXTENSIONS.iter().any(|lib| ext.eq_ignore_ascii_case(lib)));
        if is_library {
            self.dylib.load(archive, registry)
        } else {
            self.manifest.load(archive, registry)
        }
    }
}
