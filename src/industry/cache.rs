//! Bounded, thread-safe LRU for depth-0 cost results.
//!
//! Reads return clones so callers can never mutate a cached tree in place.
//! Tests inject `NullCache` to exercise the engine without memoization.

use parking_lot::Mutex;
use std::collections::HashMap;

pub trait CalcCache<V: Clone>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn put(&self, key: String, value: V);
}

/// LRU over a HashMap plus an access-ordered key list. Oldest entry is
/// evicted on overflow.
pub struct LruCache<V> {
    inner: Mutex<LruInner<V>>,
    capacity: usize,
}

struct LruInner<V> {
    map: HashMap<String, V>,
    order: Vec<String>,
}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }
}

impl<V: Clone + Send + Sync> CalcCache<V> for LruCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.map.get(key).cloned() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                let k = inner.order.remove(pos);
                inner.order.push(k);
            }
            Some(value)
        } else {
            None
        }
    }

    fn put(&self, key: String, value: V) {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&key) {
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
        } else if inner.map.len() >= self.capacity {
            let oldest = inner.order.remove(0);
            inner.map.remove(&oldest);
        }
        inner.map.insert(key.clone(), value);
        inner.order.push(key);
    }
}

/// Cache that never hits. For tests and one-shot calculations.
pub struct NullCache;

impl<V: Clone> CalcCache<V> for NullCache {
    fn get(&self, _key: &str) -> Option<V> {
        None
    }

    fn put(&self, _key: String, _value: V) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let cache: LruCache<i32> = LruCache::new(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.put("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn get_refreshes_recency() {
        let cache: LruCache<i32> = LruCache::new(2);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.get("a");
        cache.put("c".to_string(), 3);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn null_cache_never_hits() {
        let cache = NullCache;
        CalcCache::<i32>::put(&cache, "a".to_string(), 1);
        assert_eq!(CalcCache::<i32>::get(&cache, "a"), None);
    }
}
