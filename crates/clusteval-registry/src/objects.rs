use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;

/// A domain object with identity, keyed by the file it was read from.
#[derive(Debug)]
pub struct Registered<T> {
    path: PathBuf,
    created_at: DateTime<Utc>,
    value: T,
}

impl<T> Registered<T> {
    pub fn new(path: impl Into<PathBuf>, value: T) -> Self {
        Self {
            path: path.into(),
            created_at: Utc::now(),
            value,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

impl<T> PartialEq for Registered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl<T> Eq for Registered<T> {}

/// Store of live [`Registered`] objects of one type.
#[derive(Debug)]
pub struct ObjectStore<T> {
    objects: RwLock<IndexMap<PathBuf, Arc<Registered<T>>>>,
}

impl<T> Default for ObjectStore<T> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(IndexMap::new()),
        }
    }
}

impl<T> ObjectStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the object at `path`; returns `true` if it was new.
    pub fn register(&self, path: impl Into<PathBuf>, value: T) -> bool {
        let object = Arc::new(Registered::new(path, value));
        self.objects
            .write()
            .insert(object.path.clone(), object)
            .is_none()
    }

    pub fn unregister(&self, path: &Path) -> bool {
        self.objects.write().shift_remove(path).is_some()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Registered<T>>> {
        self.objects.read().get(path).cloned()
    }

    /// First object whose value satisfies `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<Arc<Registered<T>>> {
        self.objects
            .read()
            .values()
            .find(|object| predicate(&object.value))
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Registered<T>>> {
        self.objects.read().values().cloned().collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn identity_is_the_path() {
        let a = Registered::new("/runs/a.run.json", 1);
        let b = Registered::new("/runs/a.run.json", 2);
        let c = Registered::new("/runs/c.run.json", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn replacement_keeps_position_and_swaps_value() {
        let store = ObjectStore::new();
        let path = PathBuf::from("/runs/a.run.json");
        assert!(store.register(&path, "first"));
        assert!(store.register("/runs/b.run.json", "other"));
        assert!(!store.register(&path, "second"));
        assert_eq!(store.paths()[0], path);
        assert_eq!(*store.get(&path).unwrap().value(), "second");
    }

    #[test]
    fn find_and_unregister() {
        let store = ObjectStore::new();
        store.register("/runs/a.run.json", "alpha".to_string());
        store.register("/runs/b.run.json", "beta".to_string());
        let found = store.find(|name| name == "beta").unwrap();
        assert_eq!(found.path(), Path::new("/runs/b.run.json"));
        assert!(store.unregister(Path::new("/runs/a.run.json")));
        assert!(!store.unregister(Path::new("/runs/a.run.json")));
        assert_eq!(store.len(), 1);
    }
}
