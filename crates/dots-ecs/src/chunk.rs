//! Fixed-size chunk memory.
//!
//! A chunk is a [`CHUNK_SIZE`] byte block holding up to
//! [`MAX_ENTITIES_PER_CHUNK`] entities of one archetype in structure-of-arrays
//! layout: a [`ChunkHeader`] followed by one column per in-chunk component
//! type. Chunk memory is plain bytes, so a chunk can be copied to a file and
//! back verbatim; every value is read and written with unaligned `Pod` copies.

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::{EcsError, EcsResult, blob::BlobBatchId, entity::Entity};

/// Size of one chunk in bytes.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on entities per chunk; one `u128` enable-bit group covers a chunk.
pub const MAX_ENTITIES_PER_CHUNK: usize = 128;

/// Size of the [`ChunkHeader`] at the start of every chunk.
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Size of the [`BufferHeader`] at the start of every buffer slot.
pub const BUFFER_HEADER_SIZE: usize = 16;

/// Largest number of chunks handed out by one contiguous block allocation.
pub const MAX_CHUNKS_PER_BLOCK: usize = 64;

const COLUMN_ALIGN: usize = 16;

/// Header stored in the first [`CHUNK_HEADER_SIZE`] bytes of each chunk.
///
/// `archetype`, `list_index` and `sequence` are runtime bookkeeping.
/// `meta_entity` refers to the entity holding this chunk's chunk components,
/// or is null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkHeader {
    pub archetype: u32,
    pub count: u32,
    pub capacity: u32,
    pub list_index: u32,
    pub sequence: u64,
    pub meta_entity: Entity,
    pub flags: u32,
    pub reserved: [u32; 7],
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

impl ChunkHeader {
    /// Read the header at the start of a chunk.
    #[must_use]
    pub fn read(chunk: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&chunk[..CHUNK_HEADER_SIZE])
    }

    /// Write the header at the start of a chunk.
    pub fn write(&self, chunk: &mut [u8]) {
        chunk[..CHUNK_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }
}

/// Header of a dynamic buffer slot.
///
/// `pointer` is a heap handle when the buffer has spilled out of its inline
/// storage, or 0 when elements live inline right after the header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BufferHeader {
    pub pointer: u64,
    pub length: i32,
    pub capacity: i32,
}

const _: () = assert!(std::mem::size_of::<BufferHeader>() == BUFFER_HEADER_SIZE);

impl BufferHeader {
    /// Whether the elements live in a heap allocation.
    #[must_use]
    pub const fn is_spilled(&self) -> bool {
        self.pointer != 0
    }
}

/// Component stored on a meta entity naming the chunk it describes.
///
/// Rebuilt after load; never persisted with meaningful contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkLink {
    pub archetype: u32,
    pub chunk: u32,
}

impl ChunkLink {
    pub const NONE: Self = Self {
        archetype: u32::MAX,
        chunk: u32::MAX,
    };
}

impl Default for ChunkLink {
    fn default() -> Self {
        Self::NONE
    }
}

impl crate::Component for ChunkLink {
    const NAME: &'static str = "dots::ChunkLink";
}

/// Placement of one component column inside a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnLayout {
    /// Byte offset of row 0.
    pub offset: u32,
    /// Bytes per row.
    pub stride: u32,
}

impl ColumnLayout {
    /// Byte range of `row` within the chunk.
    #[must_use]
    pub const fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        let start = self.offset as usize + row * self.stride as usize;
        start..start + self.stride as usize
    }
}

/// Computes how many rows fit in a chunk and where each column starts.
///
/// `strides` holds one entry per archetype type; `None` for types that do not
/// occupy chunk memory. Columns are laid out in the given order, each aligned
/// to 16 bytes.
pub fn compute_layout(
    strides: &[Option<usize>],
) -> EcsResult<(usize, SmallVec<[Option<ColumnLayout>; 8]>)> {
    let per_row: usize = strides.iter().flatten().sum();
    let available = CHUNK_SIZE - CHUNK_HEADER_SIZE;
    let mut capacity = if per_row == 0 {
        MAX_ENTITIES_PER_CHUNK
    } else {
        (available / per_row).min(MAX_ENTITIES_PER_CHUNK)
    };

    while capacity > 0 {
        let mut offset = CHUNK_HEADER_SIZE;
        let mut columns = SmallVec::with_capacity(strides.len());
        for stride in strides {
            match stride {
                Some(stride) => {
                    offset = offset.next_multiple_of(COLUMN_ALIGN);
                    columns.push(Some(ColumnLayout {
                        offset: offset as u32,
                        stride: *stride as u32,
                    }));
                    offset += stride * capacity;
                }
                None => columns.push(None),
            }
        }
        if offset <= CHUNK_SIZE {
            return Ok((capacity, columns));
        }
        capacity -= 1;
    }

    Err(EcsError::ArchetypeTooLarge { row_size: per_row })
}

/// Location of a chunk in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkSlot {
    block: u32,
    index: u32,
}

/// A contiguous run of zeroed chunks, handed out for bulk loading.
///
/// Fill it in place, then give it back with
/// [`World::adopt_chunk_block`](crate::World::adopt_chunk_block).
pub struct ChunkBlock {
    bytes: Vec<u8>,
}

impl ChunkBlock {
    /// Allocate `chunk_count` zeroed chunks.
    #[must_use]
    pub fn zeroed(chunk_count: usize) -> Self {
        Self {
            bytes: vec![0; chunk_count * CHUNK_SIZE],
        }
    }

    /// Wrap bytes previously taken with [`Self::into_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> EcsResult<Self> {
        if bytes.len() % CHUNK_SIZE != 0 {
            return Err(EcsError::InvalidChunkBlock { len: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// Give up the block as a byte vector, e.g. to use it as a read target.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of chunks in the block.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.bytes.len() / CHUNK_SIZE
    }

    /// Memory of chunk `index`.
    #[must_use]
    pub fn chunk(&self, index: usize) -> &[u8] {
        &self.bytes[index * CHUNK_SIZE..(index + 1) * CHUNK_SIZE]
    }

    /// Mutable memory of chunk `index`.
    pub fn chunk_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.bytes[index * CHUNK_SIZE..(index + 1) * CHUNK_SIZE]
    }
}

/// Owns chunk memory.
///
/// Memory is held in blocks of one or more chunks. A freed chunk is zeroed and
/// recycled; blocks themselves live as long as the pool.
#[derive(Default)]
pub struct ChunkPool {
    blocks: Vec<Box<[u8]>>,
    free: Vec<ChunkSlot>,
}

impl ChunkPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a zeroed chunk.
    pub fn allocate(&mut self) -> ChunkSlot {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        let block = self.blocks.len() as u32;
        self.blocks.push(vec![0; CHUNK_SIZE].into_boxed_slice());
        ChunkSlot { block, index: 0 }
    }

    /// Take ownership of a filled block; returns one slot per chunk, in order.
    pub fn adopt(&mut self, block: ChunkBlock) -> Vec<ChunkSlot> {
        let count = block.chunk_count();
        if count == 0 {
            return Vec::new();
        }
        let id = self.blocks.len() as u32;
        self.blocks.push(block.bytes.into_boxed_slice());
        (0..count as u32)
            .map(|index| ChunkSlot { block: id, index })
            .collect()
    }

    /// Return a chunk to the pool.
    pub fn free(&mut self, slot: ChunkSlot) {
        self.bytes_mut(slot).fill(0);
        self.free.push(slot);
    }

    #[must_use]
    pub fn bytes(&self, slot: ChunkSlot) -> &[u8] {
        let start = slot.index as usize * CHUNK_SIZE;
        &self.blocks[slot.block as usize][start..start + CHUNK_SIZE]
    }

    pub fn bytes_mut(&mut self, slot: ChunkSlot) -> &mut [u8] {
        let start = slot.index as usize * CHUNK_SIZE;
        &mut self.blocks[slot.block as usize][start..start + CHUNK_SIZE]
    }

    /// Number of chunks currently handed out.
    #[must_use]
    pub fn live_chunks(&self) -> usize {
        let total: usize = self.blocks.iter().map(|b| b.len() / CHUNK_SIZE).sum();
        total - self.free.len()
    }
}

/// Runtime bookkeeping for one chunk of an archetype.
///
/// The per-row data lives in pool memory; this holds what lives outside it.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub(crate) slot: ChunkSlot,
    pub(crate) count: u32,
    pub(crate) shared: SmallVec<[u32; 4]>,
    pub(crate) enabled: SmallVec<[u128; 2]>,
    pub(crate) disabled: SmallVec<[u32; 2]>,
    pub(crate) sequence: u64,
    pub(crate) blob_owners: SmallVec<[BlobBatchId; 1]>,
}

impl Chunk {
    /// Pool slot holding the chunk memory.
    #[must_use]
    pub const fn slot(&self) -> ChunkSlot {
        self.slot
    }

    /// Number of live rows.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Shared component indices, one per shared type of the archetype.
    #[must_use]
    pub fn shared(&self) -> &[u32] {
        &self.shared
    }

    /// Enable bits, one group per enableable type of the archetype.
    #[must_use]
    pub fn enabled_bits(&self) -> &[u128] {
        &self.enabled
    }

    /// Number of disabled rows, one per enableable type.
    #[must_use]
    pub fn disabled_counts(&self) -> &[u32] {
        &self.disabled
    }

    /// Order in which the chunk was created or installed.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Blob batches kept alive by this chunk.
    #[must_use]
    pub fn blob_owners(&self) -> &[BlobBatchId] {
        &self.blob_owners
    }
}

/// Count the cleared bits among the first `count` rows.
#[must_use]
pub fn count_disabled(bits: u128, count: u32) -> u32 {
    let mask = if count as usize >= MAX_ENTITIES_PER_CHUNK {
        u128::MAX
    } else {
        (1u128 << count) - 1
    };
    (!bits & mask).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_fits_chunk() {
        let (capacity, columns) = compute_layout(&[Some(8), Some(4), None, Some(100)]).unwrap();
        assert!(capacity > 0 && capacity <= MAX_ENTITIES_PER_CHUNK);
        assert!(columns[2].is_none());

        let last = columns[3].unwrap();
        assert!(last.offset as usize + last.stride as usize * capacity <= CHUNK_SIZE);
        for column in columns.iter().flatten() {
            assert_eq!(column.offset as usize % 16, 0);
        }
    }

    #[test]
    fn test_small_rows_cap_at_max() {
        let (capacity, _) = compute_layout(&[Some(8)]).unwrap();
        assert_eq!(capacity, MAX_ENTITIES_PER_CHUNK);
    }

    #[test]
    fn test_oversized_row_rejected() {
        assert!(compute_layout(&[Some(CHUNK_SIZE)]).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let header = ChunkHeader {
            archetype: 3,
            count: 7,
            capacity: 100,
            meta_entity: Entity::new(4, 1),
            ..ChunkHeader::default()
        };
        header.write(&mut chunk);
        assert_eq!(ChunkHeader::read(&chunk), header);
    }

    #[test]
    fn test_pool_recycles_zeroed() {
        let mut pool = ChunkPool::new();
        let slot = pool.allocate();
        pool.bytes_mut(slot)[100] = 9;
        pool.free(slot);
        let again = pool.allocate();
        assert_eq!(slot, again);
        assert_eq!(pool.bytes(again)[100], 0);
    }

    #[test]
    fn test_adopt_block() {
        let mut pool = ChunkPool::new();
        let mut block = ChunkBlock::zeroed(3);
        block.chunk_mut(2)[0] = 42;
        let slots = pool.adopt(block);
        assert_eq!(slots.len(), 3);
        assert_eq!(pool.bytes(slots[2])[0], 42);
        assert_eq!(pool.live_chunks(), 3);
    }

    #[test]
    fn test_block_rejects_partial_chunk() {
        assert!(ChunkBlock::from_bytes(vec![0; CHUNK_SIZE + 1]).is_err());
    }

    #[test]
    fn test_count_disabled() {
        assert_eq!(count_disabled(0b1011, 4), 1);
        assert_eq!(count_disabled(u128::MAX, 128), 0);
        assert_eq!(count_disabled(0, 128), 128);
    }
}
