use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clusteval_plugin_sdk::{
    CancelFlag, Capability, CapabilityDescriptor, CapabilityError, CapabilityFactory,
    InvocationOutput, InvocationRequest, PluginEntrypoint, PLUGIN_ENTRYPOINT,
};
use clusteval_registry::CapabilityRegistry;
use clusteval_rengine::EngineSession;
use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{ArchiveLoader, LoadError, LoadedCapability, PluginArchive};

/// Loads plugin modules built with `declare_clusteval_plugins!`.
///
/// Every archive is copied to a private shadow file before it is opened, so a
/// rewritten archive gets its own symbol namespace instead of the handle the
/// dynamic linker cached for the old file. Libraries are never unloaded while
/// a factory or capability created from them is alive.
///
/// The shadow directory belongs to one loader: copies left by an earlier
/// process are removed when the loader is created, a copy whose load fails
/// is removed at once, and a reload removes the copy it supersedes.
pub struct DylibLoader {
    shadow_dir: PathBuf,
    /// Current shadow copy per archive path.
    shadows: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl DylibLoader {
    pub fn new(shadow_dir: impl Into<PathBuf>) -> Self {
        let loader = Self {
            shadow_dir: shadow_dir.into(),
            shadows: Mutex::new(HashMap::new()),
        };
        let pruned = loader.prune();
        if pruned > 0 {
            debug!(dir = %loader.shadow_dir.display(), pruned, "removed stale shadow copies");
        }
        loader
    }

    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    /// Removes every file in the shadow directory that no loaded library
    /// uses. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.shadow_dir) else {
            return 0;
        };
        let shadows = self.shadows.lock();
        let mut pruned = 0;
        for path in entries.flatten().map(|entry| entry.path()) {
            if !path.is_file() || shadows.values().any(|shadow| shadow == &path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => pruned += 1,
                Err(err) => warn!(path = %path.display(), %err, "cannot remove shadow copy"),
            }
        }
        pruned
    }

    fn shadow_copy(&self, archive: &PluginArchive) -> Result<ShadowFile, LoadError> {
        fs::create_dir_all(&self.shadow_dir)
            .map_err(|err| LoadError::io(&self.shadow_dir, err))?;
        let file_name = format!(
            "{}-{}.{}",
            archive.name,
            Uuid::new_v4().simple(),
            archive.extension().unwrap_or("so")
        );
        let shadow = ShadowFile {
            path: self.shadow_dir.join(file_name),
            kept: false,
        };
        fs::copy(&archive.path, &shadow.path).map_err(|err| LoadError::io(&archive.path, err))?;
        Ok(shadow)
    }

    /// Makes `shadow` the archive's current copy and deletes the previous one.
    fn adopt(&self, archive: &PluginArchive, shadow: ShadowFile) -> PathBuf {
        let path = shadow.keep();
        let previous = self
            .shadows
            .lock()
            .insert(archive.path.clone(), path.clone());
        if let Some(previous) = previous {
            // Unlinking leaves the mapping of a still loaded library intact.
            if let Err(err) = fs::remove_file(&previous) {
                debug!(path = %previous.display(), %err, "superseded shadow copy kept");
            }
        }
        path
    }
}

/// A shadow copy that is deleted on drop unless [`ShadowFile::keep`] is called.
struct ShadowFile {
    path: PathBuf,
    kept: bool,
}

impl ShadowFile {
    fn keep(mut self) -> PathBuf {
        self.kept = true;
        self.path.clone()
    }
}

impl Drop for ShadowFile {
    fn drop(&mut self) {
        if !self.kept {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("clusteval-plugins"))
    }
}

impl ArchiveLoader for DylibLoader {
    fn load(
        &self,
        archive: &PluginArchive,
        _registry: &CapabilityRegistry,
    ) -> Result<Vec<LoadedCapability>, LoadError> {
        let shadow = self.shadow_copy(archive)?;
        let library = Arc::new(open_library(&shadow.path)?);
        let entrypoint = unsafe {
            *library
                .get::<PluginEntrypoint>(PLUGIN_ENTRYPOINT)
                .map_err(|_| LoadError::MissingEntrypoint {
                    path: archive.path.clone(),
                })?
        };
        let export = panic::catch_unwind(AssertUnwindSafe(|| unsafe { entrypoint() }))
            .map_err(|payload| LoadError::Panicked(panic_message(payload.as_ref())))?;

        let mut loaded = Vec::new();
        let mut found = Vec::new();
        for factory in export.into_module().into_factories() {
            let descriptor = factory.descriptor();
            if descriptor.kind != archive.kind || descriptor.name != archive.name {
                found.push(descriptor.name);
                continue;
            }
            loaded.push(LoadedCapability {
                name: descriptor.name,
                factory: Arc::new(LibraryFactory {
                    inner: Arc::from(factory),
                    library: Arc::clone(&library),
                }),
            });
        }
        if loaded.is_empty() {
            return Err(LoadError::NameMismatch {
                expected: archive.name.clone(),
                found: found.join(", "),
            });
        }
        let shadow = self.adopt(archive, shadow);
        debug!(
            path = %archive.path.display(),
            shadow = %shadow.display(),
            count = loaded.len(),
            "loaded plugin library"
        );
        Ok(loaded)
    }
}

fn open_library(path: &Path) -> Result<Library, LoadError> {
    let library = unsafe { Library::new(path) }?;
    Ok(library)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Factory that keeps its defining library loaded.
struct LibraryFactory {
    inner: Arc<dyn CapabilityFactory>,
    library: Arc<Library>,
}

impl CapabilityFactory for LibraryFactory {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.inner.descriptor()
    }

    fn create(&self) -> Arc<dyn Capability> {
        Arc::new(LibraryCapability {
            inner: self.inner.create(),
            _library: Arc::clone(&self.library),
        })
    }
}

impl fmt::Debug for LibraryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryFactory")
            .field("descriptor", &self.inner.descriptor())
            .finish()
    }
}

// Field order matters: `inner` must drop before the library it came from.
struct LibraryCapability {
    inner: Arc<dyn Capability>,
    _library: Arc<Library>,
}

impl Capability for LibraryCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        self.inner.descriptor()
    }

    fn invoke(
        &self,
        request: &InvocationRequest,
        session: Option<&mut EngineSession>,
        cancel: &CancelFlag,
    ) -> Result<InvocationOutput, CapabilityError> {
        self.inner.invoke(request, session, cancel)
    }
}

#[cfg(test)]
mod tests {
    use clusteval_plugin_sdk::CapabilityKind;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn non_library_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("FooDistanceMeasure.so");
        fs::write(&path, b"not an elf object").unwrap();
        let archive = PluginArchive::inspect(CapabilityKind::DistanceMeasure, &path).unwrap();
        let loader = DylibLoader::new(dir.path().join("shadow"));
        let err = loader
            .load(&archive, &CapabilityRegistry::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::Library(_)));
        assert_eq!(fs::read_dir(loader.shadow_dir()).unwrap().count(), 0);
    }

    #[test]
    fn stale_shadow_copies_are_removed_on_startup() {
        let dir = tempdir().unwrap();
        let shadow_dir = dir.path().join("shadow");
        fs::create_dir_all(&shadow_dir).unwrap();
        for name in ["Foo-1.so", "Foo-2.so", "Bar-3.dylib"] {
            fs::write(shadow_dir.join(name), b"left behind").unwrap();
        }
        let loader = DylibLoader::new(&shadow_dir);
        assert_eq!(fs::read_dir(&shadow_dir).unwrap().count(), 0);
        assert_eq!(loader.prune(), 0);
    }

    #[test]
    fn adopting_a_reload_removes_the_superseded_copy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("FooDistanceMeasure.so");
        fs::write(&path, b"v1").unwrap();
        let archive = PluginArchive::inspect(CapabilityKind::DistanceMeasure, &path).unwrap();
        let loader = DylibLoader::new(dir.path().join("shadow"));

        let first = loader.adopt(&archive, loader.shadow_copy(&archive).unwrap());
        fs::write(&path, b"v2").unwrap();
        let second = loader.adopt(&archive, loader.shadow_copy(&archive).unwrap());
        assert!(!first.exists());
        assert_eq!(fs::read(&second).unwrap(), b"v2");

        // The current copy survives pruning.
        assert_eq!(loader.prune(), 0);
        assert!(second.exists());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("constructor failed")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "constructor failed");
    }
}
