//! Reading a world out of a container.

use dots_ecs::{
    ArchetypeColumn, ArchetypeId, ArchetypeType, BUFFER_HEADER_SIZE, BlobBatchId, BufferHeader, CHUNK_SIZE,
    ChunkBlock, ChunkHeader, ChunkInstall, ChunkLink, ComponentId, ComponentInfo, ComponentKind, EcsError, Entity,
    FieldLayout, ManagedObject, ObjectReader, TypeFlags, WeakAssetRef, World, count_disabled, fnv1a64,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use super::{
    options::DeserializeOptions,
    relocate::{RestoreRelocator, patch_fields},
    sections::{
        ArchetypeSection, BufferRecord, BufferSection, CHUNK_COMPONENT_FLAG, EnabledSection, SECTION_REVISION,
        SharedSection, TypeEntry, ValuePayload, WorldSummary, decode_prefab, decode_type_names,
    },
};
use crate::{
    SerializationError, SerializationResult,
    batch::ReadCommand,
    format::{ContainerReader, NodeLayout, NodeRef, NodeType, StringTable},
    stream::BinaryReader,
};

/// What a world read produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorldLoad {
    /// Root entity of the prefab, if the file marks one.
    pub prefab_root: Option<Entity>,
    pub entities: u32,
    pub archetypes: usize,
    pub chunks: usize,
    pub blob_bytes: usize,
}

fn corrupt(message: impl Into<String>) -> SerializationError {
    SerializationError::Corrupt(message.into())
}

/// Section nodes below a World node.
struct Sections {
    archetypes: NodeRef,
    shared: NodeRef,
    enabled: NodeRef,
    chunks: NodeRef,
    buffers: NodeRef,
    blobs: Option<NodeRef>,
    prefab: Option<NodeRef>,
    debug: Option<NodeRef>,
}

fn check_revision<R: BinaryReader>(
    reader: &ContainerReader<R>,
    node: NodeRef,
    node_type: NodeType,
) -> SerializationResult<()> {
    let found = reader.extension(node)?;
    if found != SECTION_REVISION {
        return Err(SerializationError::RevisionMismatch {
            section: node_type.name(),
            found,
            expected: SECTION_REVISION,
        });
    }
    Ok(())
}

impl Sections {
    fn locate<R: BinaryReader>(reader: &ContainerReader<R>, world: NodeRef) -> SerializationResult<Self> {
        let optional = |node_type: NodeType| -> SerializationResult<Option<NodeRef>> {
            let Some(node) = reader.find_node_by_type(world, node_type, 1) else {
                return Ok(None);
            };
            if node_type.layout() != NodeLayout::Plain {
                check_revision(reader, node, node_type)?;
            }
            Ok(Some(node))
        };
        let required = |node_type: NodeType| -> SerializationResult<NodeRef> {
            optional(node_type)?.ok_or(SerializationError::MissingSection(node_type.name()))
        };
        Ok(Self {
            archetypes: required(NodeType::Archetypes)?,
            shared: required(NodeType::SharedAndManagedComponents)?,
            enabled: required(NodeType::EnabledBits)?,
            chunks: required(NodeType::Chunks)?,
            buffers: required(NodeType::BufferData)?,
            blobs: optional(NodeType::BlobAssets)?,
            prefab: optional(NodeType::Prefab)?,
            debug: optional(NodeType::DebugFolder)?,
        })
    }
}

/// Name recorded for `entry` in the debug tables, if the file has them.
fn debug_type_name<R: BinaryReader>(
    reader: &mut ContainerReader<R>,
    debug: Option<NodeRef>,
    entry: &TypeEntry,
) -> SerializationResult<Option<String>> {
    let Some(debug) = debug else {
        return Ok(None);
    };
    let (Some(names), Some(map)) = (
        reader.find_node_by_type(debug, NodeType::TypeNames, 1),
        reader.find_node_by_type(debug, NodeType::TypeNameMap, 1),
    ) else {
        return Ok(None);
    };
    check_revision(reader, map, NodeType::TypeNameMap)?;
    let table = StringTable::load(reader, names)?;
    let entries = decode_type_names(&reader.read_data_to_vec(map)?)?;
    Ok(entries
        .iter()
        .find(|candidate| candidate.hash == entry.hash)
        .map(|candidate| table.get(candidate.name_offset).to_owned()))
}

fn check_layout(info: &ComponentInfo, entry: &TypeEntry) -> SerializationResult<()> {
    if info.kind().tag() != entry.kind_tag {
        return Err(corrupt(format!(
            "{} was written as kind {}, registered as kind {}",
            info.name(),
            entry.kind_tag,
            info.kind().tag()
        )));
    }
    for (what, expected, actual) in [
        ("element", info.size(), entry.size as usize),
        ("chunk stride", info.chunk_stride(), entry.stride as usize),
    ] {
        if expected != actual {
            return Err(SerializationError::SizeMismatch {
                what: format!("{} {what}", info.name()),
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Map every type table entry to a registered component.
fn resolve_types<R: BinaryReader>(
    world: &World,
    reader: &mut ContainerReader<R>,
    debug: Option<NodeRef>,
    entries: &[TypeEntry],
) -> SerializationResult<Vec<ComponentId>> {
    let registry = world.components();
    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = registry.get_by_hash(entry.hash) else {
            return Err(match debug_type_name(reader, debug, entry)? {
                Some(name) => SerializationError::TypeNotFound { name, hash: entry.hash },
                None => SerializationError::UnknownTypeHash(entry.hash),
            });
        };
        check_layout(registry.info(id)?, entry)?;
        ids.push(id);
    }
    Ok(ids)
}

/// Per-column information needed to patch a chunk, captured before the
/// world is mutated.
struct ColumnPlan {
    kind: ComponentKind,
    column: ArchetypeColumn,
    element: usize,
    fields: FieldLayout,
    chunk_link: bool,
}

struct ArchetypePlan {
    id: ArchetypeId,
    capacity: usize,
    /// Component of each shared slot, in chunk shared index order.
    shared_types: SmallVec<[ComponentId; 4]>,
    enableable: usize,
    columns: Vec<ColumnPlan>,
}

fn create_archetypes(
    world: &mut World,
    section: &ArchetypeSection,
    type_ids: &[ComponentId],
) -> SerializationResult<Vec<ArchetypePlan>> {
    let mut plans = Vec::with_capacity(section.archetypes.len());
    for entry in &section.archetypes {
        let types: SmallVec<[ArchetypeType; 8]> = entry
            .types
            .iter()
            .map(|&ty| {
                let id = type_ids[(ty & !CHUNK_COMPONENT_FLAG) as usize];
                if ty & CHUNK_COMPONENT_FLAG == 0 {
                    ArchetypeType::new(id)
                } else {
                    ArchetypeType::chunk(id)
                }
            })
            .collect();
        let id = world.archetype_exact(&types)?;
        let archetype = world
            .archetype_info(id)
            .ok_or(SerializationError::Ecs(EcsError::UnknownArchetype(id)))?;
        if archetype.types().len() != types.len() {
            return Err(corrupt("archetype lists a type more than once"));
        }

        let mut columns = Vec::new();
        for (ty, column) in archetype.types().iter().zip(archetype.columns()) {
            if column.layout.is_none() {
                continue;
            }
            let info = world.components().info(ty.component)?;
            columns.push(ColumnPlan {
                kind: info.kind(),
                column: *column,
                element: info.size(),
                fields: info.fields().clone(),
                chunk_link: info.flags().contains(TypeFlags::CHUNK_LINK),
            });
        }
        plans.push(ArchetypePlan {
            id,
            capacity: archetype.chunk_capacity(),
            shared_types: archetype
                .shared_types()
                .iter()
                .map(|&position| archetype.types()[position].component)
                .collect(),
            enableable: archetype.enableable_types().len(),
            columns,
        });
    }
    Ok(plans)
}

fn next_buffer(results: &mut impl Iterator<Item = ReadCommand>) -> SerializationResult<Vec<u8>> {
    results
        .next()
        .map(|command| command.buffer)
        .ok_or_else(|| corrupt("batched read returned fewer buffers than requested"))
}

fn checked_payload<'p>(
    payload: &'p ValuePayload,
    type_ids: &[ComponentId],
    world: &World,
    expected: ComponentKind,
) -> SerializationResult<(ComponentId, &'p [u8])> {
    if fnv1a64(&payload.bytes) != payload.value_hash {
        return Err(corrupt("shared or managed value does not match its recorded hash"));
    }
    let id = type_ids
        .get(payload.type_index as usize)
        .copied()
        .ok_or_else(|| corrupt(format!("value references type {}", payload.type_index)))?;
    let info = world.components().info(id)?;
    if info.kind() != expected {
        return Err(corrupt(format!("{} value stored with the wrong kind", info.name())));
    }
    Ok((id, &payload.bytes))
}

fn read_object(
    world: &World,
    id: ComponentId,
    bytes: &[u8],
    relocator: &mut RestoreRelocator<'_>,
) -> SerializationResult<Box<dyn ManagedObject>> {
    let info = world.components().info(id)?;
    let read = info
        .managed_read()
        .ok_or_else(|| corrupt(format!("{} has no managed reader", info.name())))?;
    let mut input = ObjectReader::new(bytes, relocator);
    let value = read(&mut input)?;
    input.finish()?;
    Ok(value)
}

/// Insert shared values. Entry `i` of the result holds the live index and
/// component of file index `i + 1`.
fn insert_shared(
    world: &mut World,
    section: &SharedSection,
    type_ids: &[ComponentId],
    relocator: &mut RestoreRelocator<'_>,
) -> SerializationResult<Vec<(u32, ComponentId)>> {
    let mut map = Vec::with_capacity(section.shared_len());
    let mut owners: FxHashMap<u32, usize> = FxHashMap::default();

    for payload in &section.unmanaged {
        let (id, bytes) = checked_payload(payload, type_ids, world, ComponentKind::Shared)?;
        let mut bytes = bytes.to_vec();
        patch_fields(&mut bytes, world.components().info(id)?.fields(), relocator)?;
        map.push((world.insert_shared_unmanaged(id, &bytes)?, id));
    }
    for payload in &section.managed_shared {
        let (id, bytes) = checked_payload(payload, type_ids, world, ComponentKind::SharedManaged)?;
        let value = read_object(world, id, bytes, relocator)?;
        map.push((world.insert_shared_managed(id, value)?, id));
    }

    for (position, &(live, _)) in map.iter().enumerate() {
        let file_index = position + 1;
        if let Some(first) = owners.insert(live, file_index) {
            warn!(first, second = file_index, live, "distinct shared values loaded as one value");
        }
    }
    Ok(map)
}

/// Insert per-entity managed values; the result maps file index to live index.
fn insert_managed(
    world: &mut World,
    section: &SharedSection,
    type_ids: &[ComponentId],
    relocator: &mut RestoreRelocator<'_>,
) -> SerializationResult<Vec<u32>> {
    let mut map = Vec::with_capacity(section.managed.len() + 1);
    map.push(0);
    for payload in &section.managed {
        let (id, bytes) = checked_payload(payload, type_ids, world, ComponentKind::Managed)?;
        let value = read_object(world, id, bytes, relocator)?;
        map.push(world.insert_managed(value));
    }
    Ok(map)
}

fn read_u32(memory: &[u8], at: usize) -> u32 {
    memory
        .get(at..at + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map_or(0, u32::from_le_bytes)
}

/// Walks the flat chunk sequence, patching each chunk into its live form.
struct ChunkPatcher<'a> {
    relocator: RestoreRelocator<'a>,
    shared_map: Vec<(u32, ComponentId)>,
    managed_map: Vec<u32>,
    shared: &'a [u32],
    enabled: &'a EnabledSection,
    per_chunk: &'a [u32],
    records: std::vec::IntoIter<BufferRecord>,
    shared_cursor: usize,
    enabled_cursor: usize,
}

impl ChunkPatcher<'_> {
    fn shared_indices(&mut self, plan: &ArchetypePlan) -> SerializationResult<SmallVec<[u32; 4]>> {
        let width = plan.shared_types.len();
        let file_indices = self
            .shared
            .get(self.shared_cursor..self.shared_cursor + width)
            .ok_or_else(|| corrupt("shared index list is shorter than the chunk list"))?;
        self.shared_cursor += width;
        file_indices
            .iter()
            .zip(&plan.shared_types)
            .map(|(&index, &slot)| {
                let Some(position) = index.checked_sub(1) else {
                    return Ok(0);
                };
                let (live, component) = self.shared_map.get(position as usize).copied().ok_or(
                    SerializationError::SharedComponentOutOfRange {
                        index,
                        available: self.shared_map.len() as u32,
                    },
                )?;
                if component != slot {
                    return Err(corrupt(format!(
                        "shared index {index} holds a value of {component:?}, the chunk slot expects {slot:?}"
                    )));
                }
                Ok(live)
            })
            .collect()
    }

    fn enable_bits(&mut self, plan: &ArchetypePlan, count: u32) -> SerializationResult<(SmallVec<[u128; 2]>, SmallVec<[u32; 2]>)> {
        let range = self.enabled_cursor..self.enabled_cursor + plan.enableable;
        let (Some(bits), Some(disabled)) = (self.enabled.bits.get(range.clone()), self.enabled.disabled.get(range))
        else {
            return Err(corrupt("enable bit list is shorter than the chunk list"));
        };
        self.enabled_cursor += plan.enableable;
        for (&bits, &disabled) in bits.iter().zip(disabled) {
            if count_disabled(bits, count) != disabled {
                return Err(corrupt(format!(
                    "chunk records {disabled} disabled rows, its enable bits have {}",
                    count_disabled(bits, count)
                )));
            }
        }
        Ok((bits.into(), disabled.into()))
    }

    /// Patch one chunk in place and return what the store needs to install it.
    fn patch(
        &mut self,
        world: &mut World,
        memory: &mut [u8],
        plan: &ArchetypePlan,
        file_index: u32,
        flat_index: usize,
    ) -> SerializationResult<(ChunkInstall, Entity)> {
        let header = ChunkHeader::read(memory);
        if header.archetype != file_index {
            return Err(corrupt(format!(
                "chunk {flat_index} belongs to archetype {}, expected {file_index}",
                header.archetype
            )));
        }
        if header.count == 0 || header.count as usize > plan.capacity {
            return Err(corrupt(format!(
                "chunk {flat_index} holds {} entities, capacity {}",
                header.count, plan.capacity
            )));
        }

        let shared = self.shared_indices(plan)?;
        let (enabled, disabled) = self.enable_bits(plan, header.count)?;

        let record_count = self.per_chunk.get(flat_index).copied().unwrap_or_default();
        let mut records: FxHashMap<u32, BufferRecord> = FxHashMap::default();
        for _ in 0..record_count {
            let record = self
                .records
                .next()
                .ok_or_else(|| corrupt("buffer section holds fewer records than announced"))?;
            records.insert(record.chunk_offset, record);
        }

        for column in &plan.columns {
            let Some(layout) = column.column.layout else {
                continue;
            };
            for row in 0..header.count as usize {
                let range = layout.row_range(row);
                match column.kind {
                    ComponentKind::Data if !column.chunk_link && !column.fields.is_empty() => {
                        patch_fields(&mut memory[range], &column.fields, &mut self.relocator)?;
                    }
                    ComponentKind::Buffer { inline_capacity } => {
                        let record = records.remove(&(range.start as u32));
                        self.patch_buffer(world, &mut memory[range], column, inline_capacity, record)?;
                    }
                    ComponentKind::Managed => {
                        let index = read_u32(memory, range.start);
                        let live = self
                            .managed_map
                            .get(index as usize)
                            .copied()
                            .ok_or_else(|| corrupt(format!("managed value {index} out of range")))?;
                        memory[range.start..range.start + 4].copy_from_slice(&live.to_le_bytes());
                    }
                    _ => {}
                }
            }
        }
        if !records.is_empty() {
            return Err(corrupt(format!(
                "{} buffer records of chunk {flat_index} match no buffer",
                records.len()
            )));
        }

        let install = ChunkInstall {
            shared,
            enabled,
            disabled,
            blob_owner: None,
        };
        Ok((install, header.meta_entity))
    }

    fn patch_buffer(
        &mut self,
        world: &mut World,
        slot: &mut [u8],
        column: &ColumnPlan,
        inline_capacity: u32,
        record: Option<BufferRecord>,
    ) -> SerializationResult<()> {
        let mut header: BufferHeader = bytemuck::pod_read_unaligned(&slot[..BUFFER_HEADER_SIZE]);
        let length = usize::try_from(header.length).map_err(|_| corrupt("negative buffer length"))?;
        let capacity = usize::try_from(header.capacity).map_err(|_| corrupt("negative buffer capacity"))?;
        if length > capacity {
            return Err(corrupt(format!("buffer length {length} exceeds capacity {capacity}")));
        }
        let patch = column.element > 0 && !column.fields.is_empty();

        let Some(record) = record else {
            if capacity > inline_capacity as usize {
                return Err(corrupt("spilled buffer has no heap record"));
            }
            if patch {
                let inline = slot.get_mut(BUFFER_HEADER_SIZE..).unwrap_or_default();
                for value in inline.chunks_exact_mut(column.element).take(length) {
                    patch_fields(value, &column.fields, &mut self.relocator)?;
                }
            }
            return Ok(());
        };

        let mut bytes = record.bytes;
        if bytes.len() < length * column.element {
            return Err(SerializationError::SizeMismatch {
                what: String::from("buffer heap record"),
                expected: length * column.element,
                actual: bytes.len(),
            });
        }
        if patch {
            for value in bytes.chunks_exact_mut(column.element).take(length) {
                patch_fields(value, &column.fields, &mut self.relocator)?;
            }
        }
        header.pointer = world.insert_buffer_heap(bytes.into_boxed_slice());
        slot[..BUFFER_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        Ok(())
    }
}

/// Every section of a World node, read in one batch.
struct LoadedSections {
    table: ArchetypeSection,
    type_ids: Vec<ComponentId>,
    plans: Vec<ArchetypePlan>,
    shared: SharedSection,
    enabled: EnabledSection,
    buffers: BufferSection,
    blob_batch: Option<Vec<u8>>,
    prefab: Option<Vec<u8>>,
    /// Chunk blocks in file order, with their chunk counts.
    blocks: Vec<(usize, Vec<u8>)>,
}

fn read_sections<R: BinaryReader>(
    world: &mut World,
    reader: &mut ContainerReader<R>,
    node: NodeRef,
    options: &DeserializeOptions,
) -> SerializationResult<LoadedSections> {
    let sections = Sections::locate(reader, node)?;
    let summary = reader.read_metadata(node)?.map(WorldSummary::decode).transpose()?;

    let table = ArchetypeSection::decode(&reader.read_data_to_vec(sections.archetypes)?)?;
    if let Some(summary) = summary {
        let recorded = (
            u64::from(summary.entities),
            summary.archetypes as usize,
            summary.chunks as usize,
            summary.types as usize,
        );
        let actual = (
            table.total_entities(),
            table.archetypes.len(),
            table.total_chunks(),
            table.types.len(),
        );
        if recorded != actual {
            return Err(corrupt("world summary disagrees with the archetype table"));
        }
    }
    let type_ids = resolve_types(world, reader, sections.debug, &table.types)?;
    let plans = create_archetypes(world, &table, &type_ids)?;

    let chunk_bytes = reader.data_len(sections.chunks)?;
    if chunk_bytes != table.total_chunks() * CHUNK_SIZE {
        return Err(SerializationError::SizeMismatch {
            what: String::from("chunk section"),
            expected: table.total_chunks() * CHUNK_SIZE,
            actual: chunk_bytes,
        });
    }

    let mut commands = vec![
        reader.prefetch(sections.shared)?,
        reader.prefetch(sections.enabled)?,
        reader.prefetch(sections.buffers)?,
    ];
    for optional in [sections.blobs, sections.prefab].into_iter().flatten() {
        commands.push(reader.prefetch(optional)?);
    }
    let mut block_sizes = Vec::new();
    let mut offset = 0;
    while offset < chunk_bytes {
        let remaining = (chunk_bytes - offset) / CHUNK_SIZE;
        let block = world.allocate_chunk_block(remaining.min(options.max_chunks_per_block));
        let chunks = block.chunk_count();
        if chunks == 0 {
            return Err(corrupt("the store handed out an empty chunk block"));
        }
        commands.push(reader.prefetch_range(sections.chunks, offset, block.into_bytes())?);
        offset += chunks * CHUNK_SIZE;
        block_sizes.push(chunks);
    }

    let mut results = reader.read_batch(commands)?.into_iter();
    let shared = SharedSection::decode(&next_buffer(&mut results)?)?;
    let enabled = EnabledSection::decode(&next_buffer(&mut results)?)?;
    let buffers = BufferSection::decode(&next_buffer(&mut results)?)?;
    let blob_batch = sections.blobs.map(|_| next_buffer(&mut results)).transpose()?;
    let prefab = sections.prefab.map(|_| next_buffer(&mut results)).transpose()?;
    let blocks = block_sizes
        .into_iter()
        .map(|chunks| Ok((chunks, next_buffer(&mut results)?)))
        .collect::<SerializationResult<Vec<_>>>()?;
    debug!(chunks = table.total_chunks(), blocks = blocks.len(), "read world sections");

    let loaded = LoadedSections {
        table,
        type_ids,
        plans,
        shared,
        enabled,
        buffers,
        blob_batch,
        prefab,
        blocks,
    };
    loaded.check_chunk_tables()?;
    Ok(loaded)
}

impl LoadedSections {
    fn check_chunk_tables(&self) -> SerializationResult<()> {
        let per_archetype = |width: fn(&ArchetypePlan) -> usize| -> usize {
            self.table
                .archetypes
                .iter()
                .zip(&self.plans)
                .map(|(entry, plan)| entry.chunk_count as usize * width(plan))
                .sum()
        };
        if self.shared.chunk_indices.len() != per_archetype(|plan| plan.shared_types.len())
            || self.enabled.bits.len() != per_archetype(|plan| plan.enableable)
            || self.buffers.per_chunk.len() != self.table.total_chunks()
        {
            return Err(corrupt("per-chunk tables do not match the archetype table"));
        }
        Ok(())
    }

    /// Archetype table index of every chunk, in file order.
    fn chunk_owners(&self) -> Vec<usize> {
        self.table
            .archetypes
            .iter()
            .enumerate()
            .flat_map(|(index, entry)| std::iter::repeat_n(index, entry.chunk_count as usize))
            .collect()
    }
}

/// Patch and install every chunk block; returns the meta entity links to fix.
fn install_chunks(
    world: &mut World,
    blocks: Vec<(usize, Vec<u8>)>,
    owners: &[usize],
    plans: &[ArchetypePlan],
    patcher: &mut ChunkPatcher<'_>,
    blob_owner: Option<BlobBatchId>,
) -> SerializationResult<(Vec<(Entity, ChunkLink)>, Vec<u32>)> {
    let mut flat_index = 0;
    let mut meta_links = Vec::new();
    let mut installed = vec![0u32; plans.len()];
    for (chunks, mut memory) in blocks {
        let mut pending = Vec::with_capacity(chunks);
        for (local, chunk) in memory.chunks_exact_mut(CHUNK_SIZE).take(chunks).enumerate() {
            let owner = owners[flat_index + local];
            let (mut install, meta) = patcher.patch(world, chunk, &plans[owner], owner as u32, flat_index + local)?;
            install.blob_owner = blob_owner;
            pending.push((owner, install, meta, ChunkHeader::read(chunk).count));
        }
        flat_index += chunks;

        let slots = world.adopt_chunk_block(ChunkBlock::from_bytes(memory)?);
        for (slot, (owner, install, meta, count)) in slots.into_iter().zip(pending) {
            let plan = &plans[owner];
            let list_index = world.install_chunk(plan.id, slot, install)?;
            installed[owner] += count;
            trace!(archetype = ?plan.id, chunk = list_index, count, "restored chunk");
            if !meta.is_null() {
                let link = ChunkLink {
                    archetype: plan.id.as_raw(),
                    chunk: list_index,
                };
                meta_links.push((meta, link));
            }
        }
    }
    Ok((meta_links, installed))
}

/// Read the World node `node` into an empty `world`.
pub(crate) fn restore_world<R: BinaryReader>(
    world: &mut World,
    reader: &mut ContainerReader<R>,
    node: NodeRef,
    referenced: &[WeakAssetRef],
    options: &DeserializeOptions,
) -> SerializationResult<WorldLoad> {
    if world.entity_count() != 0 {
        return Err(SerializationError::DestinationNotEmpty(world.entity_count()));
    }
    let loaded = read_sections(world, reader, node, options)?;
    let total_entities =
        u32::try_from(loaded.table.total_entities()).map_err(|_| corrupt("entity count does not fit in 32 bits"))?;
    let owners = loaded.chunk_owners();
    let LoadedSections {
        table,
        type_ids,
        plans,
        shared,
        enabled,
        buffers,
        blob_batch,
        prefab,
        blocks,
    } = loaded;

    world.reserve_entities_exact(total_entities)?;
    let (blob_owner, blob_base, blob_len) = match blob_batch {
        Some(batch) if !batch.is_empty() => {
            let len = batch.len();
            let (id, base) = world.insert_blob_batch(batch);
            (Some(id), base, len)
        }
        _ => (None, 0, 0),
    };

    let mut relocator = RestoreRelocator {
        blob_base,
        blob_len,
        referenced,
    };
    let shared_map = insert_shared(world, &shared, &type_ids, &mut relocator)?;
    let managed_map = insert_managed(world, &shared, &type_ids, &mut relocator)?;

    let BufferSection { per_chunk, records } = buffers;
    let mut patcher = ChunkPatcher {
        relocator,
        shared_map,
        managed_map,
        shared: &shared.chunk_indices,
        enabled: &enabled,
        per_chunk: &per_chunk,
        records: records.into_iter(),
        shared_cursor: 0,
        enabled_cursor: 0,
    };
    let (meta_links, installed) = install_chunks(world, blocks, &owners, &plans, &mut patcher, blob_owner)?;
    if patcher.records.next().is_some() {
        return Err(corrupt("buffer section holds more records than announced"));
    }
    for (entry, &count) in table.archetypes.iter().zip(&installed) {
        if entry.entity_count != count {
            return Err(corrupt(format!(
                "archetype records {} entities, its chunks hold {count}",
                entry.entity_count
            )));
        }
    }

    for (meta, link) in meta_links {
        if !world.set_chunk_link(meta, link) {
            return Err(corrupt(format!("meta entity {meta:?} has no chunk link slot")));
        }
    }
    // Restored chunks now hold the blob batch and shared values themselves.
    if let Some(id) = blob_owner {
        world.release_blob_batch(id);
    }
    for &(live, _) in &patcher.shared_map {
        world.release_shared(live);
    }

    let load = WorldLoad {
        prefab_root: prefab.as_deref().map(decode_prefab).transpose()?,
        entities: world.entity_count(),
        archetypes: plans.len(),
        chunks: owners.len(),
        blob_bytes: blob_len,
    };
    info!(
        entities = load.entities,
        archetypes = load.archetypes,
        chunks = load.chunks,
        blob_bytes = load.blob_bytes,
        "read world"
    );
    Ok(load)
}
