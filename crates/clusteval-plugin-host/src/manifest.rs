use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use clusteval_plugin_sdk::{
    CapabilityDescriptor, CapabilityId, CapabilityKind, DeclaredFactory, Invocation,
};
use clusteval_registry::CapabilityRegistry;
use serde::Deserialize;
use tracing::debug;

use crate::{ArchiveLoader, BuiltinCatalog, LoadError, LoadedCapability, PluginArchive};

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    kind: Option<CapabilityKind>,
    name: Option<String>,
    /// Name of a built-in factory to bind under the archive's name.
    factory: Option<String>,
    version: Option<String>,
    #[serde(default)]
    required_libraries: Vec<String>,
    #[serde(default)]
    accepted_formats: Vec<String>,
    produced_format: Option<String>,
    #[serde(default)]
    invocation: Invocation,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    /// `<Kind>/<Name>` capabilities that must be registered first.
    #[serde(default)]
    requires: Vec<String>,
}

/// Loads archives that are empty markers or JSON manifests.
pub struct ManifestLoader {
    catalog: Arc<BuiltinCatalog>,
}

impl ManifestLoader {
    pub fn new(catalog: Arc<BuiltinCatalog>) -> Self {
        Self { catalog }
    }

    fn builtin(&self, kind: CapabilityKind, name: &str) -> Result<LoadedCapability, LoadError> {
        self.catalog
            .get(kind, name)
            .map(|factory| LoadedCapability {
                name: name.to_string(),
                factory,
            })
            .ok_or_else(|| LoadError::UnknownFactory {
                kind,
                name: name.to_string(),
            })
    }
}

impl ArchiveLoader for ManifestLoader {
    fn load(
        &self,
        archive: &PluginArchive,
        registry: &CapabilityRegistry,
    ) -> Result<Vec<LoadedCapability>, LoadError> {
        let raw = fs::read(&archive.path).map_err(|err| LoadError::io(&archive.path, err))?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            debug!(path = %archive.path.display(), "empty archive, using built-in factory");
            return self.builtin(archive.kind, &archive.name).map(|loaded| vec![loaded]);
        }

        let manifest: ManifestFile =
            serde_json::from_slice(&raw).map_err(|source| LoadError::Manifest {
                path: archive.path.clone(),
                source,
            })?;

        if let Some(kind) = manifest.kind {
            if kind != archive.kind {
                return Err(LoadError::WrongKind {
                    expected: archive.kind,
                    found: kind,
                });
            }
        }
        if let Some(name) = &manifest.name {
            if name != &archive.name {
                return Err(LoadError::NameMismatch {
                    expected: archive.name.clone(),
                    found: name.clone(),
                });
            }
        }

        let mut missing = Vec::new();
        for requirement in &manifest.requires {
            let id: CapabilityId = requirement
                .parse()
                .map_err(|_| LoadError::InvalidRequirement(requirement.clone()))?;
            if !registry.contains(id.kind, &id.name) {
                missing.push(id);
            }
        }
        if !missing.is_empty() {
            return Err(LoadError::Unsatisfied { missing });
        }

        if let Some(factory) = &manifest.factory {
            let mut loaded = self.builtin(archive.kind, factory)?;
            loaded.name = archive.name.clone();
            return Ok(vec![loaded]);
        }

        let descriptor = CapabilityDescriptor {
            kind: archive.kind,
            name: archive.name.clone(),
            version: manifest.version,
            required_libraries: manifest.required_libraries,
            accepted_formats: manifest.accepted_formats,
            produced_format: manifest.produced_format,
            invocation: manifest.invocation,
            properties: manifest.properties,
        };
        Ok(vec![LoadedCapability {
            name: archive.name.clone(),
            factory: Arc::new(DeclaredFactory::new(descriptor)),
        }])
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn archive(dir: &Path, file: &str, kind: CapabilityKind, contents: &str) -> PluginArchive {
        let path = dir.join(file);
        fs::write(&path, contents).unwrap();
        PluginArchive::inspect(kind, path).unwrap()
    }

    fn loader() -> ManifestLoader {
        ManifestLoader::new(Arc::new(BuiltinCatalog::standard()))
    }

    #[test]
    fn empty_archive_resolves_builtin() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "ClusteringContext.jar",
            CapabilityKind::Context,
            "",
        );
        let loaded = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "Clustering");
    }

    #[test]
    fn empty_archive_without_builtin_fails() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "FooDistanceMeasure.jar",
            CapabilityKind::DistanceMeasure,
            "",
        );
        let err = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::UnknownFactory { .. }));
    }

    #[test]
    fn manifest_declares_full_capability() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "KMeansRProgram.json",
            CapabilityKind::Program,
            r#"{
                "version": "1.2",
                "required_libraries": ["stats"],
                "accepted_formats": ["Matrix"],
                "produced_format": "TabSeparated",
                "invocation": { "type": "r_script", "script": "kmeans(x, {{k}})" },
                "properties": { "maxK": "20" }
            }"#,
        );
        let loaded = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap();
        let descriptor = loaded[0].factory.descriptor();
        assert_eq!(descriptor.name, "KMeans");
        assert_eq!(descriptor.required_libraries, vec!["stats"]);
        assert_eq!(descriptor.version.as_deref(), Some("1.2"));
        assert_eq!(descriptor.property("maxK"), Some("20"));
    }

    #[test]
    fn factory_alias_binds_under_archive_name() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "FooDistanceMeasure.jar",
            CapabilityKind::DistanceMeasure,
            r#"{ "factory": "Euclidian" }"#,
        );
        let loaded = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap();
        assert_eq!(loaded[0].name, "Foo");
        assert_eq!(loaded[0].factory.descriptor().name, "Euclidian");
    }

    #[test]
    fn unmet_requirements_postpone_the_archive() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "FuzzyRunResultFormat.json",
            CapabilityKind::RunResultFormat,
            r#"{
                "produced_format": "TabSeparated",
                "requires": ["RunResultFormat/TabSeparated"]
            }"#,
        );
        let registry = CapabilityRegistry::new();
        let err = loader().load(&archive, &registry).unwrap_err();
        assert!(err.is_postponed());

        let catalog = BuiltinCatalog::standard();
        let tab = catalog
            .get(CapabilityKind::RunResultFormat, "TabSeparated")
            .unwrap();
        registry.register(CapabilityKind::RunResultFormat, "TabSeparated", tab);
        assert_eq!(loader().load(&archive, &registry).unwrap()[0].name, "Fuzzy");
    }

    #[test]
    fn manifest_for_other_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "FooDistanceMeasure.json",
            CapabilityKind::DistanceMeasure,
            r#"{ "kind": "Context" }"#,
        );
        let err = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::WrongKind { .. }));
    }

    #[test]
    fn garbage_is_a_manifest_error() {
        let dir = tempdir().unwrap();
        let archive = archive(
            dir.path(),
            "FooDistanceMeasure.jar",
            CapabilityKind::DistanceMeasure,
            "PK\u{3}\u{4} not json",
        );
        let err = loader()
            .load(&archive, &CapabilityRegistry::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::Manifest { .. }));
    }
}
