use std::hash::Hash;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A hash map behind a reader-writer lock. Callbacks passed to [MutexMap::each] and
///  [MutexMap::clear] run while the lock is held and must not call back into the same map.
pub struct MutexMap<K, V> {
    map: RwLock<FxHashMap<K, V>>,
}

impl<K: Hash + Eq, V> Default for MutexMap<K, V> {
    fn default() -> Self {
        MutexMap { map: RwLock::new(FxHashMap::default()) }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> MutexMap<K, V> {
    pub fn new() -> MutexMap<K, V> {
        Default::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map.read().get(key).cloned()
    }

    /// returns the previous value for the key, if any
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    pub fn delete(&self, key: &K) {
        self.map.write().remove(key);
    }

    pub fn get_and_delete(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    /// removes the entry only if the predicate holds for it, evaluated under the write lock
    pub fn delete_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut map = self.map.write();
        if map.get(key).is_some_and(predicate) {
            map.remove(key)
        }
        else {
            None
        }
    }

    pub fn has(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Returns the existing value, or inserts the one created by `f`. The flag is `true` if
    ///  the value was newly created.
    pub fn get_or_insert_with(&self, key: K, f: impl FnOnce() -> V) -> (V, bool) {
        if let Some(existing) = self.get(&key) {
            return (existing, false);
        }

        let mut map = self.map.write();
        if let Some(existing) = map.get(&key) {
            return (existing.clone(), false);
        }
        let value = f();
        map.insert(key, value.clone());
        (value, true)
    }

    /// Iterates over the entries under the read lock. Returning `true` from the callback
    ///  stops the iteration early.
    pub fn each(&self, mut callback: impl FnMut(&K, &V) -> bool) {
        for (k, v) in self.map.read().iter() {
            if callback(k, v) {
                break;
            }
        }
    }

    pub fn values(&self) -> Vec<V> {
        self.map.read().values().cloned().collect()
    }

    pub fn find(&self, mut predicate: impl FnMut(&V) -> bool) -> Option<V> {
        self.map.read().values()
            .find(|v| predicate(v))
            .cloned()
    }

    /// removes all entries, invoking the callback on each removed entry
    pub fn clear(&self, mut callback: impl FnMut(&K, &V)) {
        let drained = std::mem::take(&mut *self.map.write());
        for (k, v) in drained.iter() {
            callback(k, v);
        }
    }
}
