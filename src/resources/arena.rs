//! Generation-checked handles for externally supplied assets.
//!
//! A handle that outlives its entry resolves to `None` instead of aliasing
//! whatever was inserted into the reused slot.

use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Handle to a registered mesh
    pub struct MeshHandle;
    /// Handle to a registered material
    pub struct MaterialHandle;
}

/// A labelled slot map; lookups of stale handles are logged once per call site
#[derive(Debug)]
pub struct Arena<K: slotmap::Key, V> {
    label: &'static str,
    entries: SlotMap<K, V>,
}

impl<K: slotmap::Key, V> Arena<K, V> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, value: V) -> K {
        self.entries.insert(value)
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Like `get`, but logs a warning when the handle is stale
    pub fn resolve(&self, key: K) -> Option<&V> {
        let entry = self.entries.get(key);
        if entry.is_none() {
            log::warn!("Stale {} handle {:?}", self.label, key);
        }
        entry
    }

    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.entries.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut arena: Arena<MeshHandle, &str> = Arena::new("mesh");
        let first = arena.insert("road");
        arena.remove(first);
        let second = arena.insert("park");

        assert!(arena.get(first).is_none());
        assert!(arena.resolve(first).is_none());
        assert_eq!(arena.get(second), Some(&"park"));
    }
}
