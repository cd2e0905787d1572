//! Immutable blob assets referenced from component memory.
//!
//! A blob is a `{header, payload}` record living inside an allocation owned by
//! the [`BlobStore`]. A [`BlobAssetReference`] holds the runtime address of the
//! payload; the header sits in the [`BLOB_HEADER_SIZE`] bytes before it.
//! Addresses are synthetic and never reused, so a stale reference resolves to
//! nothing instead of to another blob.

use std::{collections::BTreeMap, fmt};

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;

use crate::component::fnv1a64;

/// Size of the [`BlobHeader`] preceding every blob payload.
pub const BLOB_HEADER_SIZE: usize = 16;

const BLOB_ALIGN: usize = 16;
const FIRST_ADDRESS: u64 = 0x0001_0000;
const ADDRESS_GAP: u64 = 0x100;

/// Reference to a blob payload, as stored inside component memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BlobAssetReference {
    pub ptr: u64,
}

impl BlobAssetReference {
    pub const NULL: Self = Self { ptr: 0 };

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.ptr == 0
    }
}

impl fmt::Debug for BlobAssetReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("BlobAssetReference(null)");
        }
        write!(f, "BlobAssetReference({:#x})", self.ptr)
    }
}

/// Header in front of every blob payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BlobHeader {
    /// Payload length in bytes, without padding.
    pub length: u32,
    pub reserved: u32,
    /// FNV-1a 64 of the payload.
    pub hash: u64,
}

/// Bytes a record with a `payload_len` payload occupies, padding included.
#[must_use]
pub const fn blob_record_len(payload_len: usize) -> usize {
    BLOB_HEADER_SIZE + payload_len.next_multiple_of(BLOB_ALIGN)
}

/// Build a `{header, padded payload}` record.
#[must_use]
pub fn encode_blob_record(payload: &[u8]) -> Vec<u8> {
    let header = BlobHeader {
        length: payload.len() as u32,
        reserved: 0,
        hash: fnv1a64(payload),
    };
    let mut record = Vec::with_capacity(blob_record_len(payload.len()));
    record.extend_from_slice(bytemuck::bytes_of(&header));
    record.extend_from_slice(payload);
    record.resize(blob_record_len(payload.len()), 0);
    record
}

/// Identifies one blob allocation (a single blob or a loaded batch).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobBatchId(u32);

struct BlobAllocation {
    id: BlobBatchId,
    data: Box<[u8]>,
    refcount: u32,
}

/// Owns blob allocations and resolves references into them.
pub struct BlobStore {
    allocations: BTreeMap<u64, BlobAllocation>,
    bases: HashMap<BlobBatchId, u64>,
    next_id: u32,
    next_address: u64,
}

impl Default for BlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            bases: HashMap::new(),
            next_id: 0,
            next_address: FIRST_ADDRESS,
        }
    }

    /// Create a single blob from `payload`, held with one reference.
    pub fn create(&mut self, payload: &[u8]) -> (BlobBatchId, BlobAssetReference) {
        let (id, base) = self.insert_batch(encode_blob_record(payload));
        let reference = BlobAssetReference {
            ptr: base + BLOB_HEADER_SIZE as u64,
        };
        (id, reference)
    }

    /// Take ownership of a batch of concatenated blob records, held with one
    /// reference. Returns the batch id and its base address.
    pub fn insert_batch(&mut self, data: Vec<u8>) -> (BlobBatchId, u64) {
        let id = BlobBatchId(self.next_id);
        self.next_id += 1;

        let base = self.next_address;
        self.next_address = (base + data.len() as u64).next_multiple_of(ADDRESS_GAP) + ADDRESS_GAP;

        self.bases.insert(id, base);
        self.allocations.insert(
            base,
            BlobAllocation {
                id,
                data: data.into_boxed_slice(),
                refcount: 1,
            },
        );
        (id, base)
    }

    /// Add a reference to an allocation. Returns false if it no longer exists.
    pub fn retain(&mut self, id: BlobBatchId) -> bool {
        let Some(base) = self.bases.get(&id) else {
            return false;
        };
        match self.allocations.get_mut(base) {
            Some(allocation) => {
                allocation.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference; frees the allocation when none remain.
    ///
    /// Returns true if the allocation was freed.
    pub fn release(&mut self, id: BlobBatchId) -> bool {
        let Some(&base) = self.bases.get(&id) else {
            return false;
        };
        let Some(allocation) = self.allocations.get_mut(&base) else {
            return false;
        };
        allocation.refcount -= 1;
        if allocation.refcount > 0 {
            return false;
        }
        self.allocations.remove(&base);
        self.bases.remove(&id);
        true
    }

    fn locate(&self, address: u64) -> Option<(u64, &BlobAllocation)> {
        let (&base, allocation) = self.allocations.range(..=address).next_back()?;
        (address < base + allocation.data.len() as u64).then_some((base, allocation))
    }

    /// Resolve a reference to its allocation and the offset of its header
    /// within that allocation.
    #[must_use]
    pub fn resolve(&self, reference: BlobAssetReference) -> Option<(BlobBatchId, usize)> {
        let header_address = reference.ptr.checked_sub(BLOB_HEADER_SIZE as u64)?;
        let (base, allocation) = self.locate(header_address)?;
        let offset = (header_address - base) as usize;
        if offset + BLOB_HEADER_SIZE > allocation.data.len() {
            return None;
        }
        Some((allocation.id, offset))
    }

    #[must_use]
    pub fn header(&self, reference: BlobAssetReference) -> Option<BlobHeader> {
        let (id, offset) = self.resolve(reference)?;
        let data = &self.allocation(id)?.data;
        Some(bytemuck::pod_read_unaligned(
            &data[offset..offset + BLOB_HEADER_SIZE],
        ))
    }

    /// Payload bytes of a blob.
    #[must_use]
    pub fn data(&self, reference: BlobAssetReference) -> Option<&[u8]> {
        let header = self.header(reference)?;
        let (id, offset) = self.resolve(reference)?;
        let start = offset + BLOB_HEADER_SIZE;
        self.allocation(id)?
            .data
            .get(start..start + header.length as usize)
    }

    /// The full `{header, padded payload}` record of a blob.
    #[must_use]
    pub fn record(&self, reference: BlobAssetReference) -> Option<&[u8]> {
        let header = self.header(reference)?;
        let (id, offset) = self.resolve(reference)?;
        let data = &self.allocation(id)?.data;
        let end = (offset + blob_record_len(header.length as usize)).min(data.len());
        data.get(offset..end)
    }

    fn allocation(&self, id: BlobBatchId) -> Option<&BlobAllocation> {
        self.allocations.get(self.bases.get(&id)?)
    }

    /// Current reference count of an allocation.
    #[must_use]
    pub fn refcount(&self, id: BlobBatchId) -> Option<u32> {
        self.allocation(id).map(|a| a.refcount)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
