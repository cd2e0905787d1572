//! Writing a world into a container.

use dots_ecs::{
    Archetype, BUFFER_HEADER_SIZE, BufferHeader, ChunkHeader, ComponentId, ComponentInfo, ComponentKind,
    ComponentRegistry, EcsError, Entity, ManagedObject, ObjectError, ObjectWriter, SharedValue, TypeFlags,
    WeakAssetRef, World, fnv1a64,
};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::{
    options::SerializeOptions,
    relocate::{BlobCollector, CaptureRelocator, EntityRemap, WeakAssetTable, patch_fields},
    sections::{
        ArchetypeEntry, ArchetypeSection, BufferRecord, BufferSection, CHUNK_COMPONENT_FLAG, EnabledSection,
        SECTION_REVISION, SharedSection, TypeEntry, TypeNameEntry, ValuePayload, WorldSummary, encode_type_names,
    },
};
use crate::{
    NotSerializableReason, SerializationError, SerializationResult,
    format::{ContainerWriter, NodeType, StringTableWriter},
    stream::BinaryWriter,
};

/// Archetypes with entities, minus those made only of transient types,
/// ordered by content hash.
fn persisted_archetypes(world: &World) -> SerializationResult<Vec<&Archetype>> {
    let registry = world.components();
    let mut selected = Vec::new();
    for archetype in world.archetypes() {
        if archetype.is_empty() {
            continue;
        }
        let mut transient_only = archetype.types().len() > 1;
        for ty in archetype.types().iter().skip(1) {
            if !registry.info(ty.component)?.flags().contains(TypeFlags::TRANSIENT) {
                transient_only = false;
            }
        }
        if transient_only {
            debug!(archetype = ?archetype.id(), "skipping transient archetype");
            continue;
        }
        selected.push(archetype);
    }
    selected.sort_by_key(|archetype| (archetype.stable_hash(), archetype.id()));
    Ok(selected)
}

fn check_serializable(info: &ComponentInfo) -> SerializationResult<()> {
    let reason = if info.flags().contains(TypeFlags::TRANSIENT) {
        NotSerializableReason::Transient
    } else if info.flags().contains(TypeFlags::NATIVE_POINTER) {
        NotSerializableReason::NativePointer
    } else if info.kind() == ComponentKind::Shared
        && !info.fields().entities.is_empty()
        && !info.flags().contains(TypeFlags::ALLOW_ENTITY_SERIALIZATION)
    {
        NotSerializableReason::SharedWithEntityReferences
    } else {
        return Ok(());
    };
    Err(SerializationError::NotSerializable {
        name: info.name(),
        reason,
    })
}

/// Distinct types of the written archetypes, in first-use order.
struct TypeTable<'w> {
    index: FxHashMap<ComponentId, u32>,
    infos: Vec<&'w ComponentInfo>,
}

impl<'w> TypeTable<'w> {
    fn build(registry: &'w ComponentRegistry, archetypes: &[&Archetype]) -> SerializationResult<Self> {
        let mut table = Self {
            index: FxHashMap::default(),
            infos: Vec::new(),
        };
        for archetype in archetypes {
            for ty in archetype.types() {
                if table.index.contains_key(&ty.component) {
                    continue;
                }
                let info = registry.info(ty.component)?;
                check_serializable(info)?;
                debug!(name = info.name(), hash = %info.stable_hash(), kind = info.kind().tag(), "type");
                table.index.insert(ty.component, table.infos.len() as u32);
                table.infos.push(info);
            }
        }
        Ok(table)
    }

    fn get(&self, id: ComponentId) -> SerializationResult<u32> {
        self.index
            .get(&id)
            .copied()
            .ok_or(SerializationError::Ecs(EcsError::UnknownComponent(id)))
    }

    fn entries(&self) -> Vec<TypeEntry> {
        self.infos
            .iter()
            .map(|info| TypeEntry {
                hash: info.stable_hash(),
                kind_tag: info.kind().tag(),
                size: info.size() as u32,
                stride: info.chunk_stride() as u32,
            })
            .collect()
    }
}

fn archetype_section(table: &TypeTable<'_>, archetypes: &[&Archetype]) -> SerializationResult<ArchetypeSection> {
    let mut section = ArchetypeSection {
        types: table.entries(),
        archetypes: Vec::with_capacity(archetypes.len()),
    };
    for archetype in archetypes {
        let mut types = SmallVec::with_capacity(archetype.types().len());
        for ty in archetype.types() {
            let flag = if ty.chunk_component { CHUNK_COMPONENT_FLAG } else { 0 };
            types.push(table.get(ty.component)? | flag);
        }
        section.archetypes.push(ArchetypeEntry {
            entity_count: archetype.entity_count(),
            chunk_count: archetype.chunks().len() as u32,
            types,
        });
    }
    Ok(section)
}

fn write_debug_names<W: BinaryWriter>(
    writer: &mut ContainerWriter<W>,
    table: &TypeTable<'_>,
) -> SerializationResult<()> {
    writer.create_node(NodeType::DebugFolder, Uuid::nil())?;
    let mut names = StringTableWriter::begin(writer, NodeType::TypeNames, Uuid::nil())?;
    let mut entries = Vec::with_capacity(table.infos.len());
    for info in &table.infos {
        entries.push(TypeNameEntry {
            hash: info.stable_hash(),
            name_offset: names.add(writer, info.name())?,
        });
    }
    names.finish(writer)?;
    writer.write_node(
        NodeType::TypeNameMap,
        Uuid::nil(),
        SECTION_REVISION,
        &encode_type_names(&entries),
    )?;
    writer.end_node()
}

fn write_object(
    value: &dyn ManagedObject,
    info: &ComponentInfo,
    entities_allowed: bool,
    relocator: &mut CaptureRelocator<'_, '_>,
) -> SerializationResult<Vec<u8>> {
    let mut out = ObjectWriter::new(relocator).with_entities_allowed(entities_allowed);
    value.write(&mut out).map_err(|err| match err {
        ObjectError::EntityNotAllowed => SerializationError::NotSerializable {
            name: info.name(),
            reason: NotSerializableReason::SharedWithEntityReferences,
        },
        other => other.into(),
    })?;
    Ok(out.into_bytes())
}

fn payload(type_index: u32, bytes: Vec<u8>) -> ValuePayload {
    ValuePayload {
        type_index,
        value_hash: fnv1a64(&bytes),
        bytes,
    }
}

/// File index of a collected live value; index 0 stays the default.
fn collected_index(map: &FxHashMap<u32, u32>, index: u32, what: &str) -> SerializationResult<u32> {
    if index == 0 {
        return Ok(0);
    }
    map.get(&index)
        .copied()
        .ok_or_else(|| SerializationError::Corrupt(format!("{what} value {index} was not collected")))
}

/// Shared and managed values, plus the live-to-file index maps for both.
struct ValueTables {
    section: SharedSection,
    shared: FxHashMap<u32, u32>,
    managed: FxHashMap<u32, u32>,
}

fn collect_values(
    world: &World,
    archetypes: &[&Archetype],
    table: &TypeTable<'_>,
    relocator: &mut CaptureRelocator<'_, '_>,
) -> SerializationResult<ValueTables> {
    let registry = world.components();
    let store = world.shared_components();

    // Unmanaged values take the low file indices so they can be inserted
    // first on load.
    let mut unmanaged = Vec::new();
    let mut managed_shared = Vec::new();
    let mut seen = FxHashSet::default();
    for archetype in archetypes {
        for chunk in archetype.chunks() {
            for &index in chunk.shared() {
                if index == 0 || !seen.insert(index) {
                    continue;
                }
                let entry = store
                    .get(index)
                    .ok_or_else(|| SerializationError::Corrupt(format!("chunk uses missing shared value {index}")))?;
                match entry.value() {
                    SharedValue::Unmanaged(_) => unmanaged.push(index),
                    SharedValue::Managed(_) => managed_shared.push(index),
                }
            }
        }
    }

    let mut tables = ValueTables {
        section: SharedSection::default(),
        shared: FxHashMap::default(),
        managed: FxHashMap::default(),
    };
    for (file_index, &index) in unmanaged.iter().chain(&managed_shared).enumerate() {
        tables.shared.insert(index, file_index as u32 + 1);
    }

    for index in unmanaged.into_iter().chain(managed_shared) {
        let Some(entry) = store.get(index) else {
            continue;
        };
        let info = registry.info(entry.component())?;
        let type_index = table.get(entry.component())?;
        match entry.value() {
            SharedValue::Unmanaged(bytes) => {
                let mut bytes = bytes.to_vec();
                patch_fields(&mut bytes, info.fields(), relocator)?;
                tables.section.unmanaged.push(payload(type_index, bytes));
            }
            SharedValue::Managed(value) => {
                let allowed = info.flags().contains(TypeFlags::ALLOW_ENTITY_SERIALIZATION);
                let bytes = write_object(&**value, info, allowed, relocator)?;
                tables.section.managed_shared.push(payload(type_index, bytes));
            }
        }
    }

    for archetype in archetypes {
        for (ty, column) in archetype.types().iter().zip(archetype.columns()) {
            let (ComponentKind::Managed, Some(layout)) = (column.kind, column.layout) else {
                continue;
            };
            let info = registry.info(ty.component)?;
            let type_index = table.get(ty.component)?;
            for chunk in archetype.chunks() {
                let memory = world.chunk_memory(chunk);
                for row in 0..chunk.count() as usize {
                    let index = read_u32(memory, layout.row_range(row).start);
                    if index == 0 || tables.managed.contains_key(&index) {
                        continue;
                    }
                    let value = world
                        .managed_components()
                        .get(index)
                        .ok_or_else(|| SerializationError::Corrupt(format!("chunk uses missing managed value {index}")))?;
                    let bytes = write_object(value, info, true, relocator)?;
                    tables.section.managed.push(payload(type_index, bytes));
                    tables.managed.insert(index, tables.section.managed.len() as u32);
                }
            }
        }
    }

    for archetype in archetypes {
        for chunk in archetype.chunks() {
            for &index in chunk.shared() {
                let file_index = collected_index(&tables.shared, index, "shared")?;
                tables.section.chunk_indices.push(file_index);
            }
        }
    }
    Ok(tables)
}

fn enabled_section(archetypes: &[&Archetype]) -> EnabledSection {
    let mut section = EnabledSection::default();
    for chunk in archetypes.iter().flat_map(|archetype| archetype.chunks()) {
        section.bits.extend_from_slice(chunk.enabled_bits());
        section.disabled.extend_from_slice(chunk.disabled_counts());
    }
    section
}

fn read_u32(memory: &[u8], at: usize) -> u32 {
    memory
        .get(at..at + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map_or(0, u32::from_le_bytes)
}

/// Rewrites one chunk copy into its file form.
struct ChunkRewriter<'a, 'r, 'w> {
    world: &'a World,
    relocator: &'a mut CaptureRelocator<'r, 'w>,
    managed: &'a FxHashMap<u32, u32>,
    buffers: &'a mut BufferSection,
}

impl ChunkRewriter<'_, '_, '_> {
    fn rewrite(
        &mut self,
        scratch: &mut [u8],
        archetype: &Archetype,
        file_index: u32,
        count: u32,
    ) -> SerializationResult<()> {
        let mut header = ChunkHeader::read(scratch);
        header.archetype = file_index;
        header.list_index = 0;
        header.sequence = 0;
        if !header.meta_entity.is_null() {
            header.meta_entity = self.relocator.entities.get(header.meta_entity);
        }
        header.write(scratch);

        let registry = self.world.components();
        let capacity = archetype.chunk_capacity();
        let mut records = 0u32;
        for (ty, column) in archetype.types().iter().zip(archetype.columns()) {
            let Some(layout) = column.layout else {
                continue;
            };
            let info = registry.info(ty.component)?;
            let stride = layout.stride as usize;
            let start = layout.offset as usize;
            scratch[start + count as usize * stride..start + capacity * stride].fill(0);

            for row in 0..count as usize {
                let range = layout.row_range(row);
                match column.kind {
                    ComponentKind::Entity => {
                        let entity: Entity = bytemuck::pod_read_unaligned(&scratch[range.clone()]);
                        let remapped = self.relocator.entities.get(entity);
                        scratch[range].copy_from_slice(bytemuck::bytes_of(&remapped));
                    }
                    ComponentKind::Data if info.flags().contains(TypeFlags::CHUNK_LINK) => {
                        scratch[range].fill(0);
                    }
                    ComponentKind::Data => {
                        if !info.fields().is_empty() {
                            patch_fields(&mut scratch[range], info.fields(), self.relocator)?;
                        }
                    }
                    ComponentKind::Buffer { .. } => {
                        if self.rewrite_buffer(&mut scratch[range.clone()], info, range.start)? {
                            records += 1;
                        }
                    }
                    ComponentKind::Managed => {
                        let live = read_u32(scratch, range.start);
                        let stored = collected_index(self.managed, live, "managed")?;
                        scratch[range.start..range.start + 4].copy_from_slice(&stored.to_le_bytes());
                    }
                    ComponentKind::Shared | ComponentKind::SharedManaged => {}
                }
            }
        }
        self.buffers.per_chunk.push(records);
        Ok(())
    }

    /// Patch one buffer slot. Returns true if its heap contents were recorded.
    fn rewrite_buffer(&mut self, slot: &mut [u8], info: &ComponentInfo, chunk_offset: usize) -> SerializationResult<bool> {
        let mut header: BufferHeader = bytemuck::pod_read_unaligned(&slot[..BUFFER_HEADER_SIZE]);
        let element = info.size();
        let length = usize::try_from(header.length).unwrap_or_default();

        if !header.is_spilled() {
            if element > 0 && !info.fields().is_empty() {
                let inline = slot.get_mut(BUFFER_HEADER_SIZE..).unwrap_or_default();
                for value in inline.chunks_exact_mut(element).take(length) {
                    patch_fields(value, info.fields(), self.relocator)?;
                }
            }
            return Ok(false);
        }

        let heap = self.world.buffer_heap().get(header.pointer).ok_or_else(|| {
            SerializationError::Corrupt(format!("buffer of {} points at a freed heap allocation", info.name()))
        })?;
        let capacity = usize::try_from(header.capacity).unwrap_or_default();
        let mut bytes = heap
            .get(..capacity * element)
            .ok_or_else(|| {
                SerializationError::Corrupt(format!(
                    "buffer of {} claims capacity {capacity}, its heap allocation holds {} bytes",
                    info.name(),
                    heap.len()
                ))
            })?
            .to_vec();
        if element > 0 && !info.fields().is_empty() {
            for value in bytes.chunks_exact_mut(element).take(length) {
                patch_fields(value, info.fields(), self.relocator)?;
            }
        }
        self.buffers.records.push(BufferRecord {
            chunk_offset: chunk_offset as u32,
            bytes,
        });
        header.pointer = 0;
        slot[..BUFFER_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        Ok(true)
    }
}

/// Write the World node and its sections as a child of the current node.
pub(crate) fn capture_world<W: BinaryWriter>(
    world: &World,
    writer: &mut ContainerWriter<W>,
    options: &SerializeOptions,
) -> SerializationResult<Vec<WeakAssetRef>> {
    let archetypes = persisted_archetypes(world)?;
    let table = TypeTable::build(world.components(), &archetypes)?;
    let archetype_section = archetype_section(&table, &archetypes)?;
    let entities = EntityRemap::build(world, &archetypes);
    let mut blobs = BlobCollector::new(world.blobs());
    let mut weak_assets = WeakAssetTable::default();
    let mut relocator = CaptureRelocator {
        entities: &entities,
        blobs: &mut blobs,
        weak_assets: &mut weak_assets,
    };

    let summary = WorldSummary {
        entities: entities.len() as u32,
        archetypes: archetypes.len() as u32,
        chunks: archetype_section.total_chunks() as u32,
        types: table.infos.len() as u32,
    };
    writer.create_node(NodeType::World, Uuid::nil())?;
    writer.set_metadata(&summary.encode())?;

    if options.debug_type_names {
        write_debug_names(writer, &table)?;
    }

    let archetype_bytes = archetype_section.encode();
    debug!(types = table.infos.len(), archetypes = archetypes.len(), bytes = archetype_bytes.len(), "archetype table");
    writer.write_node(NodeType::Archetypes, Uuid::nil(), SECTION_REVISION, &archetype_bytes)?;

    let values = collect_values(world, &archetypes, &table, &mut relocator)?;
    let shared_bytes = values.section.encode();
    debug!(
        shared = values.section.shared_len(),
        managed = values.section.managed.len(),
        bytes = shared_bytes.len(),
        "shared and managed values"
    );
    writer.write_node(NodeType::SharedAndManagedComponents, Uuid::nil(), SECTION_REVISION, &shared_bytes)?;
    writer.write_node(
        NodeType::EnabledBits,
        Uuid::nil(),
        SECTION_REVISION,
        &enabled_section(&archetypes).encode(),
    )?;

    let mut buffers = BufferSection::default();
    let mut rewriter = ChunkRewriter {
        world,
        relocator: &mut relocator,
        managed: &values.managed,
        buffers: &mut buffers,
    };
    writer.create_node(NodeType::Chunks, Uuid::nil())?;
    writer.set_extension(SECTION_REVISION)?;
    let mut scratch = Vec::with_capacity(dots_ecs::CHUNK_SIZE);
    for (file_index, archetype) in archetypes.iter().enumerate() {
        for chunk in archetype.chunks() {
            scratch.clear();
            scratch.extend_from_slice(world.chunk_memory(chunk));
            rewriter.rewrite(&mut scratch, archetype, file_index as u32, chunk.count())?;
            writer.write_data(&scratch)?;
            trace!(archetype = file_index, count = chunk.count(), "wrote chunk");
        }
    }
    writer.end_node()?;

    let buffer_bytes = buffers.encode();
    debug!(records = buffers.records.len(), bytes = buffer_bytes.len(), "buffer heap");
    writer.write_node(NodeType::BufferData, Uuid::nil(), SECTION_REVISION, &buffer_bytes)?;

    let blob_count = blobs.blob_count();
    let batch = blobs.into_batch();
    if !batch.is_empty() {
        debug!(blobs = blob_count, bytes = batch.len(), "blob batch");
        writer.write_node(NodeType::BlobAssets, Uuid::nil(), SECTION_REVISION, &batch)?;
    }

    if let Some(root) = options.prefab_root {
        let remapped = entities.get(root);
        if remapped.is_null() {
            return Err(EcsError::NoSuchEntity(root).into());
        }
        writer.write_node(
            NodeType::Prefab,
            Uuid::nil(),
            SECTION_REVISION,
            &remapped.to_bits().to_le_bytes(),
        )?;
    }
    writer.end_node()?;

    info!(
        entities = summary.entities,
        archetypes = summary.archetypes,
        chunks = summary.chunks,
        blobs = blob_count,
        blob_bytes = batch.len(),
        "wrote world"
    );
    Ok(weak_assets.into_refs())
}
