//! Indexed object store fed by watch events.
//!
//! Plays the role of an informer cache: each watcher loop applies the
//! objects it observes, and reconcilers read the latest observed state
//! without a round trip to the API server. Named indexers provide reverse
//! lookups (e.g. locks by owning attachment).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::key::NamespacedName;

/// Extracts the index values of an object for one named index.
pub type IndexFn<K> = fn(&K) -> Vec<String>;

/// A cache of the latest observed edition of every object of one resource
/// type, with optional named reverse indices.
pub struct Store<K> {
    inner: Mutex<Inner<K>>,
}

struct Inner<K> {
    objects: HashMap<NamespacedName, Arc<K>>,
    indexers: Vec<(&'static str, IndexFn<K>)>,
    // index name -> index value -> keys of matching objects
    indices: HashMap<&'static str, HashMap<String, HashSet<NamespacedName>>>,
    synced: bool,
}

impl<K> Store<K> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                indexers: Vec::new(),
                indices: HashMap::new(),
                synced: false,
            }),
        }
    }

    /// Registers a named indexer. Must be called before any object is
    /// applied.
    pub fn with_indexer(self, name: &'static str, f: IndexFn<K>) -> Self {
        {
            let mut inner = self.lock();
            inner.indexers.push((name, f));
            inner.indices.insert(name, HashMap::new());
        }
        self
    }

    /// Records the latest observed edition of an object, replacing any
    /// previous one and updating every index.
    pub fn apply(&self, key: NamespacedName, obj: Arc<K>) {
        let mut inner = self.lock();
        if let Some(old) = inner.objects.remove(&key) {
            inner.deindex(&key, &old);
        }
        inner.index(&key, &obj);
        inner.objects.insert(key, obj);
    }

    /// Drops an object and its index entries.
    pub fn delete(&self, key: &NamespacedName) {
        let mut inner = self.lock();
        if let Some(old) = inner.objects.remove(key) {
            inner.deindex(key, &old);
        }
    }

    pub fn get(&self, key: &NamespacedName) -> Option<Arc<K>> {
        self.lock().objects.get(key).cloned()
    }

    /// All objects whose indexer emitted `value` for the named index.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<K>> {
        let inner = self.lock();
        let Some(keys) = inner.indices.get(index).and_then(|idx| idx.get(value)) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect()
    }

    /// Marks the initial listing as delivered.
    pub fn mark_synced(&self) {
        self.lock().synced = true;
    }

    pub fn has_synced(&self) -> bool {
        self.lock().synced
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Inner<K> {
    fn index(&mut self, key: &NamespacedName, obj: &K) {
        for (name, f) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn deindex(&mut self, key: &NamespacedName, obj: &K) {
        for (name, f) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in f(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Obj {
        owner: &'static str,
    }

    fn owner_index(obj: &Obj) -> Vec<String> {
        vec![obj.owner.to_string()]
    }

    #[test]
    fn get_returns_latest_applied_edition() {
        let store = Store::new().with_indexer("owner", owner_index);
        let key = NamespacedName::new("ns", "x");
        store.apply(key.clone(), Arc::new(Obj { owner: "a" }));
        store.apply(key.clone(), Arc::new(Obj { owner: "b" }));
        assert_eq!(store.get(&key).unwrap().owner, "b");
    }

    #[test]
    fn reindexes_on_apply_and_delete() {
        let store = Store::new().with_indexer("owner", owner_index);
        let key = NamespacedName::new("ns", "x");
        store.apply(key.clone(), Arc::new(Obj { owner: "a" }));
        assert_eq!(store.by_index("owner", "a").len(), 1);

        store.apply(key.clone(), Arc::new(Obj { owner: "b" }));
        assert!(store.by_index("owner", "a").is_empty());
        assert_eq!(store.by_index("owner", "b").len(), 1);

        store.delete(&key);
        assert!(store.by_index("owner", "b").is_empty());
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn unknown_index_yields_nothing() {
        let store: Store<Obj> = Store::new();
        assert!(store.by_index("owner", "a").is_empty());
    }

    #[test]
    fn sync_mark_is_sticky() {
        let store: Store<Obj> = Store::new();
        assert!(!store.has_synced());
        store.mark_synced();
        assert!(store.has_synced());
    }
}
