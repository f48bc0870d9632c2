use super::lock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Priority order over unique keys. Equal priorities keep insertion order.
struct PriorityOrder<K, O> {
    order: BTreeMap<(O, u64), K>,
    keys: FxHashMap<K, (O, u64)>,
    counter: u64,
}

impl<K: Eq + Hash + Clone, O: Ord + Clone> PriorityOrder<K, O> {
    fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            keys: FxHashMap::default(),
            counter: 0,
        }
    }

    fn insert(&mut self, key: K, order: O) -> bool {
        if self.keys.contains_key(&key) {
            return false;
        }

        let order_key = (order, self.counter);
        self.counter += 1;
        self.keys.insert(key.clone(), order_key.clone());
        self.order.insert(order_key, key);
        true
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.keys.remove(key) {
            Some(order_key) => {
                self.order.remove(&order_key);
                true
            }
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.keys.remove(&key);
        Some(key)
    }

    fn contains(&self, key: &K) -> bool {
        self.keys.contains_key(key)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Unique elements ordered by a supplied priority; the minimum is removed first.
///
/// Elements with equal priority leave in the order they were added.
pub struct OrderedSet<T, O> {
    inner: Mutex<PriorityOrder<T, O>>,
}

impl<T: Eq + Hash + Clone, O: Ord + Clone> OrderedSet<T, O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PriorityOrder::new()),
        }
    }

    /// Returns `false` if the element is already present.
    pub fn add(&self, element: T, order: O) -> bool {
        lock(&self.inner).insert(element, order)
    }

    pub fn remove(&self, element: &T) -> bool {
        lock(&self.inner).remove(element)
    }

    pub fn try_remove_min(&self) -> Option<T> {
        lock(&self.inner).pop_min()
    }

    pub fn contains(&self, element: &T) -> bool {
        lock(&self.inner).contains(element)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Eq + Hash + Clone, O: Ord + Clone> Default for OrderedSet<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

/// Map variant of [`OrderedSet`]: keys carry a value and are ordered by priority.
pub struct OrderedMap<K, V, O> {
    inner: Mutex<OrderedMapInner<K, V, O>>,
}

struct OrderedMapInner<K, V, O> {
    order: PriorityOrder<K, O>,
    values: FxHashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V, O: Ord + Clone> OrderedMap<K, V, O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OrderedMapInner {
                order: PriorityOrder::new(),
                values: FxHashMap::default(),
            }),
        }
    }

    /// Returns `false` and keeps the existing value if the key is already present.
    pub fn add(&self, key: K, value: V, order: O) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.order.insert(key.clone(), order) {
            return false;
        }
        inner.values.insert(key, value);
        true
    }

    pub fn try_remove(&self, key: &K) -> Option<V> {
        let mut inner = lock(&self.inner);
        inner.order.remove(key);
        inner.values.remove(key)
    }

    pub fn try_remove_min(&self) -> Option<(K, V)> {
        let mut inner = lock(&self.inner);
        let key = inner.order.pop_min()?;
        let value = inner.values.remove(&key)?;
        Some((key, value))
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.inner).order.contains(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V, O: Ord + Clone> Default for OrderedMap<K, V, O> {
    fn default() -> Self {
        Self::new()
    }
}
