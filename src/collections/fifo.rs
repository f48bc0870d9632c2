use super::lock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A collection of unique elements kept in the order they were enqueued.
///
/// Unlike a plain queue, any element can be removed in `O(log n)`, not only the head.
pub struct FifoSet<T> {
    inner: Mutex<FifoSetInner<T>>,
}

struct FifoSetInner<T> {
    order: BTreeMap<u64, T>,
    positions: FxHashMap<T, u64>,
    counter: u64,
}

impl<T: Eq + Hash + Clone> FifoSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FifoSetInner {
                order: BTreeMap::new(),
                positions: FxHashMap::default(),
                counter: 0,
            }),
        }
    }

    /// Append an element. Returns `false` if it is already queued.
    pub fn try_enqueue(&self, element: T) -> bool {
        let mut inner = lock(&self.inner);
        if inner.positions.contains_key(&element) {
            return false;
        }

        let position = inner.counter;
        inner.counter += 1;
        inner.positions.insert(element.clone(), position);
        inner.order.insert(position, element);
        true
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        let (_, element) = inner.order.pop_first()?;
        inner.positions.remove(&element);
        Some(element)
    }

    pub fn try_peek(&self) -> Option<T> {
        let inner = lock(&self.inner);
        inner.order.values().next().cloned()
    }

    /// Remove an arbitrary element. Returns `false` if it was not queued.
    pub fn try_remove(&self, element: &T) -> bool {
        let mut inner = lock(&self.inner);
        match inner.positions.remove(element) {
            Some(position) => {
                inner.order.remove(&position);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, element: &T) -> bool {
        lock(&self.inner).positions.contains_key(element)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Eq + Hash + Clone> Default for FifoSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A key-value map whose keys are kept in the order they were enqueued.
///
/// Used where a queued element carries state, e.g. a throttled indexing task keyed by the
/// file it belongs to.
pub struct FifoMap<K, V> {
    inner: Mutex<FifoMapInner<K, V>>,
}

struct FifoMapInner<K, V> {
    order: BTreeMap<u64, K>,
    entries: FxHashMap<K, (u64, V)>,
    counter: u64,
}

impl<K: Eq + Hash + Clone, V> FifoMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FifoMapInner {
                order: BTreeMap::new(),
                entries: FxHashMap::default(),
                counter: 0,
            }),
        }
    }

    /// Append `key` with `value`. Returns `false` and leaves the map untouched if the key
    /// is already queued.
    pub fn try_enqueue(&self, key: K, value: V) -> bool {
        let mut inner = lock(&self.inner);
        if inner.entries.contains_key(&key) {
            return false;
        }

        let position = inner.counter;
        inner.counter += 1;
        inner.order.insert(position, key.clone());
        inner.entries.insert(key, (position, value));
        true
    }

    pub fn try_dequeue(&self) -> Option<(K, V)> {
        let mut inner = lock(&self.inner);
        let (_, key) = inner.order.pop_first()?;
        let (_, value) = inner.entries.remove(&key)?;
        Some((key, value))
    }

    pub fn try_remove(&self, key: &K) -> Option<V> {
        let mut inner = lock(&self.inner);
        let (position, value) = inner.entries.remove(key)?;
        inner.order.remove(&position);
        Some(value)
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V: Clone> FifoMap<K, V> {
    /// The oldest key and a clone of its value, without removing it.
    pub fn try_peek(&self) -> Option<(K, V)> {
        let inner = lock(&self.inner);
        let key = inner.order.values().next()?;
        let (_, value) = inner.entries.get(key)?;
        Some((key.clone(), value.clone()))
    }
}

impl<K: Eq + Hash + Clone, V> Default for FifoMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
