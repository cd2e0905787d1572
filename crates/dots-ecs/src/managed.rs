//! Managed component values.
//!
//! Managed components are arbitrary Rust values stored outside chunk memory.
//! The chunk holds a `u32` index into the [`ManagedStore`]; index 0 means
//! "no value".

use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
};

use rustc_hash::FxHasher;

use crate::object::{ObjectResult, ObjectWriter, Persist};

/// A component type stored by value outside chunk memory.
///
/// With `SHARED = true` the type is a shared component: one value per chunk,
/// deduplicated by equality. Shared values may only contain entity fields
/// when `ALLOW_ENTITY_SERIALIZATION` is set.
pub trait ManagedComponent: Persist + Clone + PartialEq + Hash + Send + Sync + 'static {
    /// Registered name.
    const NAME: &'static str;
    const SHARED: bool = false;
    const ALLOW_ENTITY_SERIALIZATION: bool = false;
}

/// Object-safe view of a [`ManagedComponent`].
pub trait ManagedObject: Send + Sync {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()>;
    fn clone_object(&self) -> Box<dyn ManagedObject>;
    fn as_any(&self) -> &dyn Any;
    fn value_hash(&self) -> u64;
    fn equals(&self, other: &dyn ManagedObject) -> bool;
}

impl<T: ManagedComponent> ManagedObject for T {
    fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
        Persist::write(self, writer)
    }

    fn clone_object(&self) -> Box<dyn ManagedObject> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn equals(&self, other: &dyn ManagedObject) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

impl fmt::Debug for dyn ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedObject({:#018x})", self.value_hash())
    }
}

/// Slab of managed component values.
#[derive(Default)]
pub struct ManagedStore {
    values: Vec<Option<Box<dyn ManagedObject>>>,
    free: Vec<u32>,
}

impl ManagedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value; returns its non-zero index.
    pub fn insert(&mut self, value: Box<dyn ManagedObject>) -> u32 {
        if let Some(index) = self.free.pop() {
            self.values[index as usize - 1] = Some(value);
            return index;
        }
        self.values.push(Some(value));
        self.values.len() as u32
    }

    /// Replace the value at `index`. Returns false if the slot is empty.
    pub fn replace(&mut self, index: u32, value: Box<dyn ManagedObject>) -> bool {
        match self.slot_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<Box<dyn ManagedObject>> {
        let value = self.slot_mut(index)?.take()?;
        self.free.push(index);
        Some(value)
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<&dyn ManagedObject> {
        let slot = index.checked_sub(1)? as usize;
        self.values.get(slot)?.as_deref()
    }

    fn slot_mut(&mut self, index: u32) -> Option<&mut Option<Box<dyn ManagedObject>>> {
        let slot = index.checked_sub(1)? as usize;
        self.values.get_mut(slot)
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
