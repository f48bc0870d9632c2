use super::lock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;
use std::sync::Mutex;

/// Groups unique values by key. Empty groups are dropped.
pub struct SetGrouping<K, V> {
    groups: Mutex<FxHashMap<K, FxHashSet<V>>>,
}

impl<K: Eq + Hash, V: Eq + Hash + Clone> SetGrouping<K, V> {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns `false` if the value was already in the group.
    pub fn try_add(&self, key: K, value: V) -> bool {
        lock(&self.groups).entry(key).or_default().insert(value)
    }

    pub fn try_remove(&self, key: &K, value: &V) -> bool {
        let mut groups = lock(&self.groups);
        let Some(values) = groups.get_mut(key) else {
            return false;
        };

        let removed = values.remove(value);
        if values.is_empty() {
            groups.remove(key);
        }
        removed
    }

    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.groups).contains_key(key)
    }

    /// A snapshot of the values grouped under `key`.
    pub fn get(&self, key: &K) -> Vec<V> {
        lock(&self.groups)
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty groups.
    pub fn len(&self) -> usize {
        lock(&self.groups).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash, V: Eq + Hash + Clone> Default for SetGrouping<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
