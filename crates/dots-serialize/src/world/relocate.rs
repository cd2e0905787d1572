//! Translation of runtime-only values between a live world and a file.
//!
//! Entities, blob references and weak asset references never reach a file in
//! their live form. Capture maps entities to dense indices, blob references to
//! offsets into one blob batch and weak references to 1-based indices into a
//! side table. Restore maps them back.

use bytemuck::Pod;
use dots_ecs::{
    Archetype, BLOB_HEADER_SIZE, BlobAssetReference, BlobStore, CHUNK_HEADER_SIZE, Entity, FieldLayout, ObjectError,
    ObjectResult, ReadRelocator, WeakAssetRef, World, WriteRelocator,
};
use rustc_hash::FxHashMap;

use crate::{SerializationError, SerializationResult};

/// Serialized value of a null blob reference.
pub const NULL_BLOB_OFFSET: i64 = -1;

/// Applied to raw component fields inside chunk or shared memory.
pub(crate) trait FieldRelocator {
    fn entity_field(&mut self, entity: Entity) -> SerializationResult<Entity>;
    fn blob_field(&mut self, raw: u64) -> SerializationResult<u64>;
    fn weak_field(&mut self, asset: WeakAssetRef) -> SerializationResult<WeakAssetRef>;
}

fn field_mut(element: &mut [u8], offset: u32, len: usize) -> SerializationResult<&mut [u8]> {
    let start = offset as usize;
    let element_len = element.len();
    element.get_mut(start..start + len).ok_or_else(|| {
        SerializationError::Corrupt(format!(
            "field at offset {offset} overruns a {}-byte element",
            element_len
        ))
    })
}

fn rewrite<T: Pod>(
    element: &mut [u8],
    offset: u32,
    map: impl FnOnce(T) -> SerializationResult<T>,
) -> SerializationResult<()> {
    let field = field_mut(element, offset, size_of::<T>())?;
    let value = map(bytemuck::pod_read_unaligned(field))?;
    field.copy_from_slice(bytemuck::bytes_of(&value));
    Ok(())
}

/// Run every relocatable field of one element through `relocator`.
pub(crate) fn patch_fields(
    element: &mut [u8],
    fields: &FieldLayout,
    relocator: &mut impl FieldRelocator,
) -> SerializationResult<()> {
    for &offset in &fields.entities {
        rewrite(element, offset, |entity: Entity| relocator.entity_field(entity))?;
    }
    for &offset in &fields.blobs {
        rewrite(element, offset, |raw: u64| relocator.blob_field(raw))?;
    }
    for &offset in &fields.weak_assets {
        rewrite(element, offset, |asset: WeakAssetRef| relocator.weak_field(asset))?;
    }
    Ok(())
}

/// Entities in the first `count` rows of a chunk's entity column.
pub(crate) fn chunk_entities(memory: &[u8], count: u32) -> impl Iterator<Item = Entity> + '_ {
    memory
        .get(CHUNK_HEADER_SIZE..)
        .unwrap_or_default()
        .chunks_exact(Entity::SIZE)
        .take(count as usize)
        .map(bytemuck::pod_read_unaligned)
}

/// Live entity to file entity, assigned densely in archetype, chunk and row
/// order with version 1.
#[derive(Debug, Default)]
pub(crate) struct EntityRemap {
    map: FxHashMap<Entity, Entity>,
}

impl EntityRemap {
    pub(crate) fn build(world: &World, archetypes: &[&Archetype]) -> Self {
        let mut map = FxHashMap::default();
        for archetype in archetypes {
            for chunk in archetype.chunks() {
                for entity in chunk_entities(world.chunk_memory(chunk), chunk.count()) {
                    let next = Entity::new(map.len() as u32, 1);
                    map.insert(entity, next);
                }
            }
        }
        Self { map }
    }

    /// The file entity, or null for an entity that is not being written.
    pub(crate) fn get(&self, entity: Entity) -> Entity {
        self.map.get(&entity).copied().unwrap_or(Entity::NULL)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Collects every reachable blob into one batch.
pub(crate) struct BlobCollector<'w> {
    store: &'w BlobStore,
    offsets: FxHashMap<u64, i64>,
    batch: Vec<u8>,
}

impl<'w> BlobCollector<'w> {
    pub(crate) fn new(store: &'w BlobStore) -> Self {
        Self {
            store,
            offsets: FxHashMap::default(),
            batch: Vec::new(),
        }
    }

    /// Batch offset of the blob's record, appending it on first sight.
    pub(crate) fn offset_of(&mut self, blob: BlobAssetReference) -> ObjectResult<i64> {
        if blob.is_null() {
            return Ok(NULL_BLOB_OFFSET);
        }
        if let Some(&offset) = self.offsets.get(&blob.ptr) {
            return Ok(offset);
        }
        let record = self.store.record(blob).ok_or(ObjectError::UnknownBlob(blob.ptr))?;
        let offset = self.batch.len() as i64;
        self.batch.extend_from_slice(record);
        self.offsets.insert(blob.ptr, offset);
        Ok(offset)
    }

    pub(crate) fn blob_count(&self) -> usize {
        self.offsets.len()
    }

    pub(crate) fn into_batch(self) -> Vec<u8> {
        self.batch
    }
}

/// Distinct weak asset references, returned to the caller after capture.
#[derive(Debug, Default)]
pub(crate) struct WeakAssetTable {
    indices: FxHashMap<WeakAssetRef, i32>,
    refs: Vec<WeakAssetRef>,
}

impl WeakAssetTable {
    pub(crate) fn index_of(&mut self, asset: WeakAssetRef) -> i32 {
        if asset.is_null() {
            return 0;
        }
        *self.indices.entry(asset).or_insert_with(|| {
            self.refs.push(asset);
            self.refs.len() as i32
        })
    }

    pub(crate) fn into_refs(self) -> Vec<WeakAssetRef> {
        self.refs
    }
}

/// Relocator used while a world is written.
pub(crate) struct CaptureRelocator<'a, 'w> {
    pub(crate) entities: &'a EntityRemap,
    pub(crate) blobs: &'a mut BlobCollector<'w>,
    pub(crate) weak_assets: &'a mut WeakAssetTable,
}

impl WriteRelocator for CaptureRelocator<'_, '_> {
    fn entity(&mut self, entity: Entity) -> ObjectResult<Entity> {
        Ok(self.entities.get(entity))
    }

    fn blob(&mut self, blob: BlobAssetReference) -> ObjectResult<i64> {
        self.blobs.offset_of(blob)
    }

    fn weak_asset(&mut self, asset: WeakAssetRef) -> ObjectResult<i32> {
        Ok(self.weak_assets.index_of(asset))
    }
}

impl FieldRelocator for CaptureRelocator<'_, '_> {
    fn entity_field(&mut self, entity: Entity) -> SerializationResult<Entity> {
        Ok(self.entities.get(entity))
    }

    fn blob_field(&mut self, raw: u64) -> SerializationResult<u64> {
        let offset = self.blobs.offset_of(BlobAssetReference { ptr: raw })?;
        Ok(offset as u64)
    }

    fn weak_field(&mut self, asset: WeakAssetRef) -> SerializationResult<WeakAssetRef> {
        Ok(WeakAssetRef::new(self.weak_assets.index_of(asset) as u64, 0))
    }
}

/// Relocator used while a world is read.
///
/// Entities were written as final dense indices and pass through unchanged.
pub(crate) struct RestoreRelocator<'a> {
    pub(crate) blob_base: u64,
    pub(crate) blob_len: usize,
    pub(crate) referenced: &'a [WeakAssetRef],
}

impl RestoreRelocator<'_> {
    fn weak(&self, index: u64) -> Option<WeakAssetRef> {
        match index {
            0 => Some(WeakAssetRef::NULL),
            n => self.referenced.get(usize::try_from(n - 1).ok()?).copied(),
        }
    }
}

impl ReadRelocator for RestoreRelocator<'_> {
    fn entity(&mut self, entity: Entity) -> ObjectResult<Entity> {
        Ok(entity)
    }

    fn blob(&mut self, offset: i64) -> ObjectResult<BlobAssetReference> {
        if offset == NULL_BLOB_OFFSET {
            return Ok(BlobAssetReference::NULL);
        }
        let start = usize::try_from(offset).map_err(|_| ObjectError::BlobOffsetOutOfRange(offset))?;
        if start + BLOB_HEADER_SIZE > self.blob_len {
            return Err(ObjectError::BlobOffsetOutOfRange(offset));
        }
        Ok(BlobAssetReference {
            ptr: self.blob_base + start as u64 + BLOB_HEADER_SIZE as u64,
        })
    }

    fn weak_asset(&mut self, index: i32) -> ObjectResult<WeakAssetRef> {
        u64::try_from(index)
            .ok()
            .and_then(|i| self.weak(i))
            .ok_or(ObjectError::WeakAssetOutOfRange {
                index,
                len: self.referenced.len(),
            })
    }
}

impl FieldRelocator for RestoreRelocator<'_> {
    fn entity_field(&mut self, entity: Entity) -> SerializationResult<Entity> {
        Ok(entity)
    }

    fn blob_field(&mut self, raw: u64) -> SerializationResult<u64> {
        Ok(self.blob(raw as i64)?.ptr)
    }

    fn weak_field(&mut self, asset: WeakAssetRef) -> SerializationResult<WeakAssetRef> {
        self.weak(asset.lo).ok_or(SerializationError::WeakAssetOutOfRange {
            index: asset.lo,
            len: self.referenced.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use dots_ecs::encode_blob_record;
    use smallvec::smallvec;

    use super::*;

    struct Offset(u32);

    impl FieldRelocator for Offset {
        fn entity_field(&mut self, entity: Entity) -> SerializationResult<Entity> {
            Ok(Entity::new(entity.index() + self.0, entity.version()))
        }

        fn blob_field(&mut self, raw: u64) -> SerializationResult<u64> {
            Ok(raw * 2)
        }

        fn weak_field(&mut self, asset: WeakAssetRef) -> SerializationResult<WeakAssetRef> {
            Ok(WeakAssetRef::new(asset.hi, asset.lo))
        }
    }

    #[test]
    fn test_patch_fields() {
        let fields = FieldLayout {
            entities: smallvec![0],
            blobs: smallvec![8],
            weak_assets: smallvec![16],
        };

        let mut element = vec![0u8; 40];
        element[..8].copy_from_slice(bytemuck::bytes_of(&Entity::new(3, 2)));
        element[8..16].copy_from_slice(&21u64.to_le_bytes());
        element[16..32].copy_from_slice(bytemuck::bytes_of(&WeakAssetRef::new(1, 9)));

        patch_fields(&mut element, &fields, &mut Offset(10)).unwrap();
        assert_eq!(
            bytemuck::pod_read_unaligned::<Entity>(&element[..8]),
            Entity::new(13, 2)
        );
        assert_eq!(u64::from_le_bytes(element[8..16].try_into().unwrap()), 42);
        assert_eq!(
            bytemuck::pod_read_unaligned::<WeakAssetRef>(&element[16..32]),
            WeakAssetRef::new(9, 1)
        );
    }

    #[test]
    fn test_field_out_of_bounds() {
        let fields = FieldLayout {
            entities: smallvec![0],
            ..FieldLayout::default()
        };
        let mut element = vec![0u8; 4];
        assert!(matches!(
            patch_fields(&mut element, &fields, &mut Offset(0)),
            Err(SerializationError::Corrupt(_))
        ));
    }

    #[test]
    fn test_blob_collector_dedupes() {
        let mut store = BlobStore::new();
        let (_, a) = store.create(b"first blob");
        let (_, b) = store.create(&[7; 3]);

        let mut blobs = BlobCollector::new(&store);
        assert_eq!(blobs.offset_of(BlobAssetReference::NULL).unwrap(), NULL_BLOB_OFFSET);
        assert_eq!(blobs.offset_of(a).unwrap(), 0);
        let second = blobs.offset_of(b).unwrap();
        assert_eq!(second, encode_blob_record(b"first blob").len() as i64);
        assert_eq!(blobs.offset_of(a).unwrap(), 0);
        assert_eq!(blobs.blob_count(), 2);
        assert!(matches!(
            blobs.offset_of(BlobAssetReference { ptr: 3 }),
            Err(ObjectError::UnknownBlob(3))
        ));

        let batch = blobs.into_batch();
        let mut loaded = BlobStore::new();
        let (_, base) = loaded.insert_batch(batch.clone());
        let mut restore = RestoreRelocator {
            blob_base: base,
            blob_len: batch.len(),
            referenced: &[],
        };
        let b_again = restore.blob(second).unwrap();
        assert_eq!(loaded.data(b_again), Some(&[7u8; 3][..]));
        assert!(restore.blob(-1).unwrap().is_null());
        assert!(restore.blob(batch.len() as i64).is_err());
    }

    #[test]
    fn test_weak_asset_indices() {
        let mut table = WeakAssetTable::default();
        let x = WeakAssetRef::new(5, 5);
        let y = WeakAssetRef::new(6, 0);
        assert_eq!(table.index_of(WeakAssetRef::NULL), 0);
        assert_eq!(table.index_of(x), 1);
        assert_eq!(table.index_of(y), 2);
        assert_eq!(table.index_of(x), 1);
        let refs = table.into_refs();

        let mut restore = RestoreRelocator {
            blob_base: 0,
            blob_len: 0,
            referenced: &refs,
        };
        assert_eq!(restore.weak_asset(2).unwrap(), y);
        assert_eq!(restore.weak_field(WeakAssetRef::new(1, 0)).unwrap(), x);
        assert!(restore.weak_asset(3).is_err());
        assert!(matches!(
            restore.weak_field(WeakAssetRef::new(9, 0)),
            Err(SerializationError::WeakAssetOutOfRange { index: 9, len: 2 })
        ));
    }
}
