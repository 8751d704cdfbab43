//! Keyed object cache with frame-stamped eviction.
//!
//! Maps a content/stream identifier to a lazily constructed object. The
//! cache is the only owner; callers get shared `Arc` handles. An entry not
//! rendered for one full draw cycle is evicted on the next
//! [`ObjectCache::clear_stale`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

struct Entry<V> {
    object: Arc<V>,
    last_rendered: u64,
}

/// Concurrency-safe keyed cache shared by the draw loop and background
/// loaders.
pub struct ObjectCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V> ObjectCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached object for `key`, constructing and storing it if
    /// absent. The entry is stamped with `frame` either way.
    pub fn get_or_insert_with(&self, key: &K, frame: u64, ctor: impl FnOnce() -> V) -> Arc<V> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            object: Arc::new(ctor()),
            last_rendered: frame,
        });
        entry.last_rendered = frame;
        Arc::clone(&entry.object)
    }

    /// Look up without constructing or touching.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.lock().unwrap();
        entries.get(key).map(|e| Arc::clone(&e.object))
    }

    /// Mark `key` as rendered in `frame` without constructing it.
    pub fn touch(&self, key: &K, frame: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.get_mut(key) {
            e.last_rendered = frame;
        }
    }

    /// Evict every entry not rendered in the current or previous display
    /// cycle. Returns the number of evicted entries; their resources are
    /// released when the last outstanding handle drops.
    pub fn clear_stale(&self, current_frame: u64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.last_rendered + 1 >= current_frame);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl<K: Eq + Hash + Clone, V> Default for ObjectCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_insert_constructs_once() {
        let cache: ObjectCache<String, u32> = ObjectCache::new();
        let key = "stream://a".to_string();
        let a = cache.get_or_insert_with(&key, 1, || 42);
        let b = cache.get_or_insert_with(&key, 1, || 99);
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_stale_keeps_previous_frame() {
        let cache: ObjectCache<&str, u32> = ObjectCache::new();
        cache.get_or_insert_with(&"a", 10, || 0);
        cache.get_or_insert_with(&"b", 9, || 0);
        cache.get_or_insert_with(&"c", 8, || 0);
        // At frame 10, "c" (last rendered frame 8) has missed a full cycle
        let evicted = cache.clear_stale(10);
        assert_eq!(evicted, 1);
        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"b").is_some());
        assert!(cache.get(&"c").is_none());
    }

    #[test]
    fn test_touch_prevents_eviction() {
        let cache: ObjectCache<&str, u32> = ObjectCache::new();
        cache.get_or_insert_with(&"a", 1, || 0);
        cache.touch(&"a", 5);
        assert_eq!(cache.clear_stale(6), 0);
        assert_eq!(cache.clear_stale(7), 1);
    }

    #[test]
    fn test_handles_outlive_eviction() {
        let cache: ObjectCache<&str, Vec<u8>> = ObjectCache::new();
        let handle = cache.get_or_insert_with(&"a", 1, || vec![1, 2, 3]);
        cache.clear_stale(100);
        assert!(cache.is_empty());
        // The caller's handle stays valid after eviction
        assert_eq!(handle.len(), 3);
    }
}
