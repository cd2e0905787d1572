//! Heap storage for dynamic buffers that outgrew their inline capacity.

/// Slab of heap allocations addressed by non-zero handles.
///
/// A handle is what a spilled [`BufferHeader`](crate::BufferHeader) stores in
/// its `pointer` field. Handles are only meaningful inside the world that
/// issued them.
#[derive(Default)]
pub struct BufferHeap {
    slots: Vec<Option<Box<[u8]>>>,
    free: Vec<usize>,
}

impl BufferHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes.
    pub fn allocate(&mut self, len: usize) -> u64 {
        self.insert(vec![0; len].into_boxed_slice())
    }

    /// Take ownership of existing bytes.
    pub fn insert(&mut self, bytes: Box<[u8]>) -> u64 {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(bytes);
                slot
            }
            None => {
                self.slots.push(Some(bytes));
                self.slots.len() - 1
            }
        };
        slot as u64 + 1
    }

    /// Release an allocation. Returns false for unknown handles.
    pub fn free(&mut self, handle: u64) -> bool {
        let Some(slot) = Self::slot(handle) else {
            return false;
        };
        match self.slots.get_mut(slot) {
            Some(entry @ Some(_)) => {
                *entry = None;
                self.free.push(slot);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn get(&self, handle: u64) -> Option<&[u8]> {
        self.slots.get(Self::slot(handle)?)?.as_deref()
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut [u8]> {
        self.slots.get_mut(Self::slot(handle)?)?.as_deref_mut()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(handle: u64) -> Option<usize> {
        handle.checked_sub(1).map(|slot| slot as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_nonzero() {
        let mut heap = BufferHeap::new();
        let a = heap.allocate(8);
        assert_ne!(a, 0);
        assert_eq!(heap.get(a).map(<[u8]>::len), Some(8));
        assert!(heap.get(0).is_none());
    }

    #[test]
    fn test_free_and_reuse() {
        let mut heap = BufferHeap::new();
        let a = heap.allocate(4);
        heap.get_mut(a).unwrap()[0] = 7;
        assert!(heap.free(a));
        assert!(!heap.free(a));
        assert!(heap.is_empty());

        let b = heap.insert(vec![1, 2, 3].into_boxed_slice());
        assert_eq!(a, b);
        assert_eq!(heap.get(b), Some(&[1, 2, 3][..]));
    }
}
