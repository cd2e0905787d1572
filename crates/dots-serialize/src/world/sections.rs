//! Payload layouts of the world sections.
//!
//! Every section is little-endian and tightly packed. Counts come first so a
//! reader can size its buffers before touching the records.

use byteorder::{ByteOrder, LittleEndian};
use dots_ecs::{Entity, StableTypeHash};
use smallvec::SmallVec;

use crate::{SerializationError, SerializationResult, format::NodeType};

/// Layout revision of every world section this crate writes.
pub const SECTION_REVISION: i32 = 1;

/// Set on an archetype's type reference when the type is a chunk component.
pub const CHUNK_COMPONENT_FLAG: u32 = 1 << 31;

/// Bounds-checked little-endian cursor over one section.
pub(crate) struct SectionReader<'a> {
    input: &'a [u8],
    section: NodeType,
}

impl<'a> SectionReader<'a> {
    pub(crate) const fn new(input: &'a [u8], section: NodeType) -> Self {
        Self { input, section }
    }

    fn truncated(&self) -> SerializationError {
        SerializationError::Corrupt(format!("{} section is truncated", self.section.name()))
    }

    pub(crate) fn bytes(&mut self, len: usize) -> SerializationResult<&'a [u8]> {
        if len > self.input.len() {
            return Err(self.truncated());
        }
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        Ok(head)
    }

    pub(crate) fn u32(&mut self) -> SerializationResult<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    pub(crate) fn u64(&mut self) -> SerializationResult<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    pub(crate) fn i32(&mut self) -> SerializationResult<i32> {
        Ok(LittleEndian::read_i32(self.bytes(4)?))
    }

    pub(crate) fn u128(&mut self) -> SerializationResult<u128> {
        Ok(LittleEndian::read_u128(self.bytes(16)?))
    }

    /// A record count, rejected if `count * min_record` exceeds what is left.
    pub(crate) fn count(&mut self, min_record: usize) -> SerializationResult<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_record) > self.input.len() {
            return Err(self.truncated());
        }
        Ok(count)
    }

    pub(crate) fn finish(self) -> SerializationResult<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(SerializationError::Corrupt(format!(
                "{} trailing bytes in {} section",
                self.input.len(),
                self.section.name()
            )))
        }
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Counts attached to the World node as metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorldSummary {
    pub entities: u32,
    pub archetypes: u32,
    pub chunks: u32,
    pub types: u32,
}

impl WorldSummary {
    const ENCODED_SIZE: usize = 16;

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_SIZE);
        for value in [self.entities, self.archetypes, self.chunks, self.types] {
            put_u32(&mut out, value);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(SerializationError::SizeMismatch {
                what: String::from("world summary"),
                expected: Self::ENCODED_SIZE,
                actual: bytes.len(),
            });
        }
        let mut input = SectionReader::new(bytes, NodeType::World);
        Ok(Self {
            entities: input.u32()?,
            archetypes: input.u32()?,
            chunks: input.u32()?,
            types: input.u32()?,
        })
    }
}

/// One entry of the type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeEntry {
    pub hash: StableTypeHash,
    pub kind_tag: u32,
    /// Element size.
    pub size: u32,
    /// Bytes per row in a chunk.
    pub stride: u32,
}

impl TypeEntry {
    const ENCODED_SIZE: usize = 24;
}

/// One entry of the archetype table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchetypeEntry {
    pub entity_count: u32,
    pub chunk_count: u32,
    /// Type table indices, with [`CHUNK_COMPONENT_FLAG`] on chunk components.
    pub types: SmallVec<[u32; 8]>,
}

/// Type table and archetype table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchetypeSection {
    pub types: Vec<TypeEntry>,
    pub archetypes: Vec<ArchetypeEntry>,
}

impl ArchetypeSection {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.types.len() as u32);
        for ty in &self.types {
            put_u64(&mut out, ty.hash.0);
            put_u32(&mut out, ty.kind_tag);
            put_u32(&mut out, ty.size);
            put_u32(&mut out, ty.stride);
            put_u32(&mut out, 0);
        }
        put_u32(&mut out, self.archetypes.len() as u32);
        for archetype in &self.archetypes {
            put_u32(&mut out, archetype.entity_count);
            put_u32(&mut out, archetype.chunk_count);
            put_u32(&mut out, archetype.types.len() as u32);
            for &ty in &archetype.types {
                put_u32(&mut out, ty);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        let mut input = SectionReader::new(bytes, NodeType::Archetypes);
        let type_count = input.count(TypeEntry::ENCODED_SIZE)?;
        let mut types = Vec::with_capacity(type_count);
        for _ in 0..type_count {
            let hash = StableTypeHash(input.u64()?);
            let kind_tag = input.u32()?;
            let size = input.u32()?;
            let stride = input.u32()?;
            input.u32()?;
            types.push(TypeEntry {
                hash,
                kind_tag,
                size,
                stride,
            });
        }

        let archetype_count = input.count(12)?;
        let mut archetypes = Vec::with_capacity(archetype_count);
        for _ in 0..archetype_count {
            let entity_count = input.u32()?;
            let chunk_count = input.u32()?;
            let len = input.count(4)?;
            let mut refs = SmallVec::with_capacity(len);
            for _ in 0..len {
                let ty = input.u32()?;
                if (ty & !CHUNK_COMPONENT_FLAG) as usize >= types.len() {
                    return Err(SerializationError::Corrupt(format!(
                        "archetype references type {} of {}",
                        ty & !CHUNK_COMPONENT_FLAG,
                        types.len()
                    )));
                }
                refs.push(ty);
            }
            archetypes.push(ArchetypeEntry {
                entity_count,
                chunk_count,
                types: refs,
            });
        }
        input.finish()?;
        Ok(Self { types, archetypes })
    }

    #[must_use]
    pub fn total_entities(&self) -> u64 {
        self.archetypes.iter().map(|a| u64::from(a.entity_count)).sum()
    }

    #[must_use]
    pub fn total_chunks(&self) -> usize {
        self.archetypes.iter().map(|a| a.chunk_count as usize).sum()
    }
}

/// A serialized shared or managed value.
///
/// `value_hash` is the FNV-1a hash of `bytes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuePayload {
    pub type_index: u32,
    pub value_hash: u64,
    pub bytes: Vec<u8>,
}

impl ValuePayload {
    const MIN_SIZE: usize = 16;

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.type_index);
        put_u64(out, self.value_hash);
        put_u32(out, self.bytes.len() as u32);
        out.extend_from_slice(&self.bytes);
    }

    fn decode(input: &mut SectionReader<'_>) -> SerializationResult<Self> {
        let type_index = input.u32()?;
        let value_hash = input.u64()?;
        let len = input.u32()? as usize;
        Ok(Self {
            type_index,
            value_hash,
            bytes: input.bytes(len)?.to_vec(),
        })
    }
}

/// Shared values, per-entity managed values and per-chunk shared indices.
///
/// Shared indices in `chunk_indices` are 1-based over `unmanaged` followed by
/// `managed_shared`; 0 is the default value. Managed columns in chunk memory
/// hold 1-based indices into `managed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharedSection {
    pub unmanaged: Vec<ValuePayload>,
    pub managed_shared: Vec<ValuePayload>,
    pub managed: Vec<ValuePayload>,
    pub chunk_indices: Vec<u32>,
}

impl SharedSection {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for list in [&self.unmanaged, &self.managed_shared, &self.managed] {
            put_u32(&mut out, list.len() as u32);
            for payload in list {
                payload.encode(&mut out);
            }
        }
        put_u32(&mut out, self.chunk_indices.len() as u32);
        for &index in &self.chunk_indices {
            put_u32(&mut out, index);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        let mut input = SectionReader::new(bytes, NodeType::SharedAndManagedComponents);
        let mut lists: [Vec<ValuePayload>; 3] = Default::default();
        for list in &mut lists {
            let count = input.count(ValuePayload::MIN_SIZE)?;
            list.reserve(count);
            for _ in 0..count {
                list.push(ValuePayload::decode(&mut input)?);
            }
        }
        let count = input.count(4)?;
        let chunk_indices = (0..count).map(|_| input.u32()).collect::<SerializationResult<_>>()?;
        input.finish()?;

        let [unmanaged, managed_shared, managed] = lists;
        Ok(Self {
            unmanaged,
            managed_shared,
            managed,
            chunk_indices,
        })
    }

    /// Number of addressable shared indices, excluding the default.
    #[must_use]
    pub fn shared_len(&self) -> usize {
        self.unmanaged.len() + self.managed_shared.len()
    }
}

/// Enable bits of every chunk, one group per enableable type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnabledSection {
    pub bits: Vec<u128>,
    /// Disabled rows per group, parallel to `bits`.
    pub disabled: Vec<u32>,
}

impl EnabledSection {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.bits.len() * 20);
        put_u32(&mut out, self.bits.len() as u32);
        for &bits in &self.bits {
            out.extend_from_slice(&bits.to_le_bytes());
        }
        for &disabled in &self.disabled {
            put_u32(&mut out, disabled);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        let mut input = SectionReader::new(bytes, NodeType::EnabledBits);
        let count = input.count(20)?;
        let bits = (0..count).map(|_| input.u128()).collect::<SerializationResult<_>>()?;
        let disabled = (0..count).map(|_| input.u32()).collect::<SerializationResult<_>>()?;
        input.finish()?;
        Ok(Self { bits, disabled })
    }
}

/// Contents of one spilled dynamic buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRecord {
    /// Offset of the buffer header within its chunk.
    pub chunk_offset: u32,
    /// The heap allocation, `capacity * element_size` bytes.
    pub bytes: Vec<u8>,
}

/// Spilled buffer contents, grouped by chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferSection {
    /// Number of records of each chunk, in chunk order.
    pub per_chunk: Vec<u32>,
    pub records: Vec<BufferRecord>,
}

impl BufferSection {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.records.iter().map(|r| 8 + r.bytes.len()).sum();
        let mut out = Vec::with_capacity(4 + self.per_chunk.len() * 4 + payload);
        put_u32(&mut out, self.per_chunk.len() as u32);
        for &count in &self.per_chunk {
            put_u32(&mut out, count);
        }
        for record in &self.records {
            put_u32(&mut out, record.chunk_offset);
            put_u32(&mut out, record.bytes.len() as u32);
            out.extend_from_slice(&record.bytes);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        let mut input = SectionReader::new(bytes, NodeType::BufferData);
        let chunks = input.count(4)?;
        let per_chunk: Vec<u32> = (0..chunks).map(|_| input.u32()).collect::<SerializationResult<_>>()?;
        let total: usize = per_chunk.iter().map(|&n| n as usize).sum();
        if total.saturating_mul(8) > bytes.len() {
            return Err(input.truncated());
        }
        let mut records = Vec::with_capacity(total);
        for _ in 0..total {
            let chunk_offset = input.u32()?;
            let len = input.u32()? as usize;
            records.push(BufferRecord {
                chunk_offset,
                bytes: input.bytes(len)?.to_vec(),
            });
        }
        input.finish()?;
        Ok(Self { per_chunk, records })
    }
}

/// Entries of the debug type name map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeNameEntry {
    pub hash: StableTypeHash,
    /// Offset into the type name string table.
    pub name_offset: i32,
}

#[must_use]
pub fn encode_type_names(entries: &[TypeNameEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 16);
    for entry in entries {
        put_u64(&mut out, entry.hash.0);
        out.extend_from_slice(&entry.name_offset.to_le_bytes());
        put_u32(&mut out, 0);
    }
    out
}

pub fn decode_type_names(bytes: &[u8]) -> SerializationResult<Vec<TypeNameEntry>> {
    if bytes.len() % 16 != 0 {
        return Err(SerializationError::SizeMismatch {
            what: String::from("type name map"),
            expected: bytes.len().next_multiple_of(16),
            actual: bytes.len(),
        });
    }
    let mut input = SectionReader::new(bytes, NodeType::TypeNameMap);
    let mut entries = Vec::with_capacity(bytes.len() / 16);
    for _ in 0..bytes.len() / 16 {
        let hash = StableTypeHash(input.u64()?);
        let name_offset = input.i32()?;
        input.u32()?;
        entries.push(TypeNameEntry { hash, name_offset });
    }
    Ok(entries)
}

pub fn decode_prefab(bytes: &[u8]) -> SerializationResult<Entity> {
    if bytes.len() != Entity::SIZE {
        return Err(SerializationError::SizeMismatch {
            what: String::from("prefab root"),
            expected: Entity::SIZE,
            actual: bytes.len(),
        });
    }
    Ok(Entity::from_bits(LittleEndian::read_u64(bytes)))
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn test_archetype_section_layout() {
        let section = ArchetypeSection {
            types: vec![TypeEntry {
                hash: StableTypeHash(0xABCD),
                kind_tag: 1,
                size: 4,
                stride: 4,
            }],
            archetypes: vec![ArchetypeEntry {
                entity_count: 3,
                chunk_count: 1,
                types: smallvec![0, CHUNK_COMPONENT_FLAG],
            }],
        };
        let bytes = section.encode();
        assert_eq!(bytes.len(), 4 + 24 + 4 + 12 + 8);
        assert_eq!(ArchetypeSection::decode(&bytes).unwrap(), section);
        assert_eq!(section.total_entities(), 3);
    }

    #[test]
    fn test_archetype_type_out_of_range() {
        let section = ArchetypeSection {
            types: Vec::new(),
            archetypes: vec![ArchetypeEntry {
                entity_count: 1,
                chunk_count: 1,
                types: smallvec![0],
            }],
        };
        assert!(matches!(
            ArchetypeSection::decode(&section.encode()),
            Err(SerializationError::Corrupt(_))
        ));
    }

    #[test]
    fn test_shared_section() {
        let section = SharedSection {
            unmanaged: vec![ValuePayload {
                type_index: 2,
                value_hash: 9,
                bytes: vec![1, 2, 3, 4],
            }],
            managed_shared: Vec::new(),
            managed: vec![ValuePayload {
                type_index: 3,
                value_hash: 1,
                bytes: b"text".to_vec(),
            }],
            chunk_indices: vec![0, 1, 1],
        };
        let decoded = SharedSection::decode(&section.encode()).unwrap();
        assert_eq!(decoded, section);
        assert_eq!(decoded.shared_len(), 1);
    }

    #[test]
    fn test_buffer_section_counts_first() {
        let section = BufferSection {
            per_chunk: vec![1, 0],
            records: vec![BufferRecord {
                chunk_offset: 1088,
                bytes: vec![7; 32],
            }],
        };
        let bytes = section.encode();
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(BufferSection::decode(&bytes).unwrap(), section);
    }

    #[test]
    fn test_truncated_sections() {
        let bytes = EnabledSection {
            bits: vec![u128::MAX, 5],
            disabled: vec![0, 126],
        }
        .encode();
        assert!(EnabledSection::decode(&bytes).is_ok());
        assert!(matches!(
            EnabledSection::decode(&bytes[..bytes.len() - 1]),
            Err(SerializationError::Corrupt(_))
        ));
        assert!(decode_prefab(&[0; 4]).is_err());
    }
}
