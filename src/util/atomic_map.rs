use std::hash::Hash;
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

/// A copy-on-write map: writers replace the whole map, readers get an immutable snapshot that
///  stays valid no matter what happens to the map afterwards.
///
/// This is meant for data with a single writer (typically a service loop) and many readers on
///  other tasks, where reads are frequent and writes are rare.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone, V: Clone> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone, V: Clone> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.load().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.load().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    pub fn load(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn values(&self) -> Vec<V> {
        self.load().values().cloned().collect()
    }

    /// returns the closure's result
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut lock = self.map.write()
            .unwrap_or_else(|e| e.into_inner());
        let mut map = (**lock).clone();
        let result = f(&mut map);
        *lock = Arc::new(map);
        result
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.update(|m| m.insert(key, value))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(|m| m.remove(key))
    }

    pub fn clear(&self) -> Vec<V> {
        self.update(|m| m.drain().map(|(_, v)| v).collect())
    }
}
