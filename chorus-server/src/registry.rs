//! Process-local registry of live objects, injected where needed

use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

/// Concurrent `key -> Arc<value>` map with an explicit register/find/unregister lifecycle
#[derive(Debug)]
pub struct Registry<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Arc<V>>,
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry previously registered under `key`, if any
    pub fn register(&self, key: K, value: Arc<V>) -> Option<Arc<V>> {
        tracing::debug!("Registered {}", key);
        self.entries.insert(key, value)
    }

    /// Register only if `key` is free; returns whether it was inserted
    pub fn register_if_absent(&self, key: K, value: Arc<V>) -> bool {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!("Registered {}", slot.key());
                slot.insert(value);
                true
            }
        }
    }

    pub fn find(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, key: &K) -> Option<Arc<V>> {
        let removed = self.entries.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            tracing::debug!("Unregistered {}", key);
        }
        removed
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        let keys = self.keys();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_find_unregister() {
        let registry: Registry<String, u32> = Registry::new();
        assert!(registry.register("a".into(), Arc::new(1)).is_none());
        assert_eq!(registry.find(&"a".to_string()).as_deref(), Some(&1));

        let previous = registry.register("a".into(), Arc::new(2));
        assert_eq!(previous.as_deref(), Some(&1));

        assert_eq!(registry.unregister(&"a".to_string()).as_deref(), Some(&2));
        assert!(registry.find(&"a".to_string()).is_none());
        assert!(registry.unregister(&"a".to_string()).is_none());
    }

    #[test]
    fn test_register_if_absent() {
        let registry: Registry<String, u32> = Registry::new();
        assert!(registry.register_if_absent("a".into(), Arc::new(1)));
        assert!(!registry.register_if_absent("a".into(), Arc::new(2)));
        assert_eq!(registry.find(&"a".to_string()).as_deref(), Some(&1));
    }

    #[test]
    fn test_independent_instances() {
        let first: Registry<String, u32> = Registry::new();
        let second: Registry<String, u32> = Registry::new();
        first.register("a".into(), Arc::new(1));

        assert!(second.is_empty());
        assert_eq!(first.drain().len(), 1);
        assert!(first.is_empty());
    }
}
