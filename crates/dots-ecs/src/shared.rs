//! Shared component values, deduplicated and reference counted.
//!
//! Index 0 is the default value of every shared type and is never stored.
//! Chunks hold one reference per non-default index they use.

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{component::ComponentId, component::fnv1a64, managed::ManagedObject};

/// A stored shared value.
pub enum SharedValue {
    /// Plain bytes of a `Pod` shared component.
    Unmanaged(Box<[u8]>),
    /// Boxed value of a shared managed component.
    Managed(Box<dyn ManagedObject>),
}

impl SharedValue {
    fn hash(&self) -> u64 {
        match self {
            Self::Unmanaged(bytes) => fnv1a64(bytes),
            Self::Managed(value) => value.value_hash(),
        }
    }

    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unmanaged(a), Self::Unmanaged(b)) => a == b,
            (Self::Managed(a), Self::Managed(b)) => a.equals(b.as_ref()),
            _ => false,
        }
    }
}

/// One entry of the store.
pub struct SharedEntry {
    component: ComponentId,
    hash: u64,
    value: SharedValue,
    refcount: u32,
}

impl SharedEntry {
    #[must_use]
    pub const fn component(&self) -> ComponentId {
        self.component
    }

    /// Value hash used for deduplication.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    #[must_use]
    pub const fn value(&self) -> &SharedValue {
        &self.value
    }

    #[must_use]
    pub const fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Table of shared component values.
#[derive(Default)]
pub struct SharedComponentStore {
    entries: Vec<Option<SharedEntry>>,
    free: Vec<u32>,
    lookup: HashMap<(ComponentId, u64), SmallVec<[u32; 1]>>,
}

impl SharedComponentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or find an unmanaged value; the caller receives one reference.
    pub fn insert_unmanaged(&mut self, component: ComponentId, bytes: &[u8]) -> u32 {
        self.insert(component, SharedValue::Unmanaged(bytes.into()))
    }

    /// Insert or find a managed value; the caller receives one reference.
    pub fn insert_managed(&mut self, component: ComponentId, value: Box<dyn ManagedObject>) -> u32 {
        self.insert(component, SharedValue::Managed(value))
    }

    fn insert(&mut self, component: ComponentId, value: SharedValue) -> u32 {
        let hash = value.hash();
        let candidates = self.lookup.entry((component, hash)).or_default();
        for &index in candidates.iter() {
            if let Some(Some(entry)) = self.entries.get_mut(index as usize - 1) {
                if entry.value.same_value(&value) {
                    entry.refcount += 1;
                    return index;
                }
            }
        }

        let entry = SharedEntry {
            component,
            hash,
            value,
            refcount: 1,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize - 1] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() as u32
            }
        };
        candidates.push(index);
        index
    }

    /// Add a reference. Index 0 is ignored.
    pub fn retain(&mut self, index: u32) {
        if let Some(entry) = self.entry_mut(index) {
            entry.refcount += 1;
        }
    }

    /// Drop a reference; the value is removed when none remain.
    pub fn release(&mut self, index: u32) {
        let Some(entry) = self.entry_mut(index) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        let key = (entry.component, entry.hash);
        self.entries[index as usize - 1] = None;
        self.free.push(index);
        if let Some(candidates) = self.lookup.get_mut(&key) {
            candidates.retain(|&mut i| i != index);
            if candidates.is_empty() {
                self.lookup.remove(&key);
            }
        }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&SharedEntry> {
        self.entries.get(index.checked_sub(1)? as usize)?.as_ref()
    }

    fn entry_mut(&mut self, index: u32) -> Option<&mut SharedEntry> {
        self.entries.get_mut(index.checked_sub(1)? as usize)?.as_mut()
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: ComponentId = ComponentId::from_raw(5);

    #[test]
    fn test_unmanaged_dedup() {
        let mut store = SharedComponentStore::new();
        let a = store.insert_unmanaged(TYPE, &[1, 2, 3, 4]);
        let b = store.insert_unmanaged(TYPE, &[1, 2, 3, 4]);
        let c = store.insert_unmanaged(TYPE, &[9, 9, 9, 9]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
        assert_eq!(store.get(a).unwrap().refcount(), 2);
    }

    #[test]
    fn test_same_bytes_different_type() {
        let mut store = SharedComponentStore::new();
        let a = store.insert_unmanaged(TYPE, &[1]);
        let b = store.insert_unmanaged(ComponentId::from_raw(6), &[1]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_release_removes() {
        let mut store = SharedComponentStore::new();
        let a = store.insert_unmanaged(TYPE, &[7]);
        store.retain(a);
        store.release(a);
        assert!(store.get(a).is_some());
        store.release(a);
        assert!(store.get(a).is_none());
        assert!(store.is_empty());

        // Default index is never stored
        store.release(0);
        assert!(store.get(0).is_none());
    }
}
