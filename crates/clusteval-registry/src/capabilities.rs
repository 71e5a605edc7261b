use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clusteval_plugin_sdk::{CapabilityDescriptor, CapabilityFactory, CapabilityId, CapabilityKind};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::RegistryError;

/// One (kind, name) → implementation binding.
pub struct Binding {
    pub descriptor: CapabilityDescriptor,
    pub factory: Arc<dyn CapabilityFactory>,
    /// Archive the binding was loaded from; `None` for compiled-in bindings.
    pub source: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.descriptor.id())
            .field("source", &self.source)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Serializable view of a binding for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSummary {
    pub kind: CapabilityKind,
    pub name: String,
    pub version: Option<String>,
    pub source: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
}

impl From<&Binding> for BindingSummary {
    fn from(binding: &Binding) -> Self {
        Self {
            kind: binding.descriptor.kind,
            name: binding.descriptor.name.clone(),
            version: binding.descriptor.version.clone(),
            source: binding.source.clone(),
            registered_at: binding.registered_at,
        }
    }
}

type KindTable = IndexMap<String, Arc<Binding>>;

/// Thread-safe map of capability kind and name to implementation.
///
/// Every mutation happens under a single write lock, so a concurrent
/// [`lookup`](Self::lookup) sees either the old or the new binding, never a
/// partially updated one. Callers must not cache lookups across calls.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    bindings: RwLock<IndexMap<CapabilityKind, KindTable>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` for `kind`. Returns `true` if the name was new and `false`
    /// if an existing binding was replaced in place.
    pub fn register(
        &self,
        kind: CapabilityKind,
        name: &str,
        factory: Arc<dyn CapabilityFactory>,
    ) -> bool {
        self.register_from(kind, name, factory, None)
    }

    /// Like [`register`](Self::register), remembering the archive the
    /// implementation came from.
    pub fn register_from(
        &self,
        kind: CapabilityKind,
        name: &str,
        factory: Arc<dyn CapabilityFactory>,
        source: Option<PathBuf>,
    ) -> bool {
        let mut descriptor = factory.descriptor();
        descriptor.kind = kind;
        descriptor.name = name.to_string();
        let binding = Arc::new(Binding {
            descriptor,
            factory,
            source,
            registered_at: Utc::now(),
        });
        let previous = self
            .bindings
            .write()
            .entry(kind)
            .or_default()
            .insert(name.to_string(), binding);
        match previous {
            Some(_) => {
                info!(%kind, name, "replaced capability binding");
                false
            }
            None => {
                info!(%kind, name, "registered capability");
                true
            }
        }
    }

    /// Removes a binding. Unknown names are a no-op returning `false`.
    pub fn unregister(&self, kind: CapabilityKind, name: &str) -> bool {
        let mut bindings = self.bindings.write();
        let removed = bindings
            .get_mut(&kind)
            .and_then(|table| table.shift_remove(name))
            .is_some();
        if removed {
            debug!(%kind, name, "unregistered capability");
        }
        removed
    }

    /// Removes every binding loaded from `source`.
    pub fn unregister_source(&self, source: &Path) -> Vec<CapabilityId> {
        let mut removed = Vec::new();
        let mut bindings = self.bindings.write();
        for (kind, table) in bindings.iter_mut() {
            table.retain(|name, binding| {
                let keep = binding.source.as_deref() != Some(source);
                if !keep {
                    removed.push(CapabilityId::new(*kind, name.clone()));
                }
                keep
            });
        }
        removed
    }

    pub fn lookup(
        &self,
        kind: CapabilityKind,
        name: &str,
    ) -> Result<Arc<dyn CapabilityFactory>, RegistryError> {
        self.binding(kind, name).map(|binding| Arc::clone(&binding.factory))
    }

    pub fn binding(&self, kind: CapabilityKind, name: &str) -> Result<Arc<Binding>, RegistryError> {
        self.bindings
            .read()
            .get(&kind)
            .and_then(|table| table.get(name))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    pub fn descriptor(
        &self,
        kind: CapabilityKind,
        name: &str,
    ) -> Result<CapabilityDescriptor, RegistryError> {
        self.binding(kind, name)
            .map(|binding| binding.descriptor.clone())
    }

    pub fn contains(&self, kind: CapabilityKind, name: &str) -> bool {
        self.bindings
            .read()
            .get(&kind)
            .is_some_and(|table| table.contains_key(name))
    }

    pub fn binding_source(&self, kind: CapabilityKind, name: &str) -> Option<PathBuf> {
        self.binding(kind, name)
            .ok()
            .and_then(|binding| binding.source.clone())
    }

    /// Bindings of one kind in registration order.
    pub fn list_by_kind(&self, kind: CapabilityKind) -> Vec<Arc<Binding>> {
        self.bindings
            .read()
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn names(&self, kind: CapabilityKind) -> Vec<String> {
        self.bindings
            .read()
            .get(&kind)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Kinds with at least one binding.
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        self.bindings
            .read()
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<BindingSummary> {
        self.bindings
            .read()
            .values()
            .flat_map(|table| table.values())
            .map(|binding| BindingSummary::from(binding.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use clusteval_plugin_sdk::DeclaredFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    fn factory(kind: CapabilityKind, name: &str, version: &str) -> Arc<dyn CapabilityFactory> {
        Arc::new(DeclaredFactory::new(
            CapabilityDescriptor::new(kind, name).with_version(version),
        ))
    }

    #[test]
    fn re_registration_replaces_without_duplicates() {
        let registry = CapabilityRegistry::new();
        let kind = CapabilityKind::DistanceMeasure;
        assert!(registry.register(kind, "Foo", factory(kind, "Foo", "1")));
        assert!(registry.register(kind, "Bar", factory(kind, "Bar", "1")));
        assert!(!registry.register(kind, "Foo", factory(kind, "Foo", "2")));

        let version = registry.lookup(kind, "Foo").unwrap().descriptor().version;
        assert_eq!(version.as_deref(), Some("2"));
        assert_eq!(registry.names(kind), vec!["Foo", "Bar"]);
        assert_eq!(registry.list_by_kind(kind).len(), 2);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let registry = CapabilityRegistry::new();
        assert!(!registry.unregister(CapabilityKind::Context, "Missing"));
        let kind = CapabilityKind::Context;
        registry.register(kind, "Clustering", factory(kind, "Clustering", "1"));
        assert!(registry.unregister(kind, "Clustering"));
        assert!(!registry.contains(kind, "Clustering"));
        assert!(registry.kinds().is_empty());
    }

    #[test]
    fn lookup_of_missing_name_reports_kind_and_name() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .lookup(CapabilityKind::Program, "Nope")
            .err()
            .unwrap();
        assert_eq!(
            err,
            RegistryError::NotFound {
                kind: CapabilityKind::Program,
                name: "Nope".into()
            }
        );
    }

    #[test]
    fn unregister_source_drops_only_that_archive() {
        let registry = CapabilityRegistry::new();
        let kind = CapabilityKind::DistanceMeasure;
        let archive = PathBuf::from("/plugins/FooDistanceMeasure.jar");
        registry.register_from(kind, "Foo", factory(kind, "Foo", "1"), Some(archive.clone()));
        registry.register(kind, "Builtin", factory(kind, "Builtin", "1"));

        let removed = registry.unregister_source(&archive);
        assert_eq!(removed, vec![CapabilityId::new(kind, "Foo")]);
        assert_eq!(registry.names(kind), vec!["Builtin"]);
        assert_eq!(registry.binding_source(kind, "Builtin"), None);
    }

    #[test]
    fn concurrent_lookups_never_miss_a_replaced_binding() {
        let registry = Arc::new(CapabilityRegistry::new());
        let kind = CapabilityKind::DistanceMeasure;
        registry.register(kind, "Foo", factory(kind, "Foo", "0"));

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for version in 1..200 {
                    registry.register(kind, "Foo", factory(kind, "Foo", &version.to_string()));
                }
            })
        };
        for _ in 0..200 {
            let descriptor = registry.descriptor(kind, "Foo").unwrap();
            assert_eq!(descriptor.name, "Foo");
            assert_eq!(registry.len(), 1);
        }
        writer.join().unwrap();
    }
}
