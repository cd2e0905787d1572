//! World - the main container for all entities, chunks and component stores.
//!
//! Values are copied in and out by value (SpacetimeDB pattern): `get` returns
//! an owned copy, `set` writes one back. Setters return `bool` (false when the
//! entity or component is missing); structural operations return
//! [`EcsResult`].
//!
//! Besides the gameplay-facing API, the world exposes the raw operations a
//! persistence layer needs to rebuild chunks verbatim: contiguous chunk
//! blocks, dense entity reservation, chunk installation, and direct inserts
//! into the shared, managed, buffer and blob stores.

#[cfg(test)]
use bytemuck::Zeroable;
use hashbrown::HashMap;
use smallvec::{SmallVec, smallvec};
use tracing::trace;

use crate::{
    EcsError, EcsResult,
    archetype::{Archetype, ArchetypeId, ArchetypeType, canonicalize},
    blob::{BlobAssetReference, BlobBatchId, BlobStore},
    buffer::BufferHeap,
    chunk::{
        BUFFER_HEADER_SIZE, BufferHeader, Chunk, ChunkBlock, ChunkHeader, ChunkLink, ChunkPool,
        ChunkSlot, ColumnLayout, MAX_CHUNKS_PER_BLOCK, count_disabled,
    },
    component::{Component, ComponentId, ComponentInfo, ComponentKind, ComponentRegistry, TypeDescriptor},
    entity::{Entity, EntityAllocator, EntityLocation},
    managed::{ManagedComponent, ManagedObject, ManagedStore},
    shared::{SharedComponentStore, SharedValue},
};

/// Bookkeeping handed to [`World::install_chunk`] alongside restored memory.
#[derive(Clone, Debug, Default)]
pub struct ChunkInstall {
    /// Shared component indices, already valid in this world.
    pub shared: SmallVec<[u32; 4]>,
    pub enabled: SmallVec<[u128; 2]>,
    pub disabled: SmallVec<[u32; 2]>,
    /// Blob allocation the chunk's memory refers into.
    pub blob_owner: Option<BlobBatchId>,
}

/// The entity store.
pub struct World {
    components: ComponentRegistry,
    entities: EntityAllocator,
    archetypes: Vec<Archetype>,
    archetype_index: HashMap<SmallVec<[ArchetypeType; 8]>, ArchetypeId>,
    pool: ChunkPool,
    buffers: BufferHeap,
    blobs: BlobStore,
    shared: SharedComponentStore,
    managed: ManagedStore,
    next_sequence: u64,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world.
    #[must_use]
    pub fn new() -> Self {
        Self {
            components: ComponentRegistry::new(),
            entities: EntityAllocator::new(),
            archetypes: Vec::new(),
            archetype_index: HashMap::new(),
            pool: ChunkPool::new(),
            buffers: BufferHeap::new(),
            blobs: BlobStore::new(),
            shared: SharedComponentStore::new(),
            managed: ManagedStore::new(),
            next_sequence: 1,
        }
    }

    // ==================== Registration ====================

    /// Register a plain-data component type.
    pub fn register<T: Component>(&mut self) -> EcsResult<ComponentId> {
        self.components.register::<T>()
    }

    /// Register a managed component type.
    pub fn register_managed<T: ManagedComponent>(&mut self) -> EcsResult<ComponentId> {
        self.components.register_managed::<T>()
    }

    /// Register a type that has no Rust counterpart in this process.
    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> EcsResult<ComponentId> {
        self.components.register_descriptor(descriptor, None)
    }

    /// Get the component ID for a Rust type, if registered.
    #[must_use]
    pub fn component_id<T: 'static>(&self) -> Option<ComponentId> {
        self.components.get_id::<T>()
    }

    /// Get the component registry.
    #[must_use]
    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    fn id_of<T: 'static>(&self) -> EcsResult<ComponentId> {
        self.components
            .get_id::<T>()
            .ok_or(EcsError::NotRegistered(std::any::type_name::<T>()))
    }

    // ==================== Archetypes ====================

    /// Get or create the archetype holding `components` plus the entity column.
    pub fn archetype(&mut self, components: &[ComponentId]) -> EcsResult<ArchetypeId> {
        self.archetype_with_chunk_components(components, &[])
    }

    /// Like [`Self::archetype`], with additional per-chunk components.
    pub fn archetype_with_chunk_components(
        &mut self,
        components: &[ComponentId],
        chunk_components: &[ComponentId],
    ) -> EcsResult<ArchetypeId> {
        let types: Vec<ArchetypeType> = std::iter::once(ArchetypeType::new(ComponentId::ENTITY))
            .chain(components.iter().copied().map(ArchetypeType::new))
            .chain(chunk_components.iter().copied().map(ArchetypeType::chunk))
            .collect();
        self.archetype_exact(&types)
    }

    /// Get or create the archetype with exactly these member types.
    ///
    /// Nothing is added implicitly; the entity column must be listed.
    pub fn archetype_exact(&mut self, types: &[ArchetypeType]) -> EcsResult<ArchetypeId> {
        let types = canonicalize(types, &self.components)?;
        if let Some(&id) = self.archetype_index.get(&types) {
            return Ok(id);
        }

        let meta = if types.iter().any(|ty| ty.chunk_component) {
            let meta_types: Vec<ArchetypeType> = [
                ArchetypeType::new(ComponentId::ENTITY),
                ArchetypeType::new(ComponentId::CHUNK_LINK),
            ]
            .into_iter()
            .chain(
                types
                    .iter()
                    .filter(|ty| ty.chunk_component)
                    .map(|ty| ArchetypeType::new(ty.component)),
            )
            .collect();
            Some(self.archetype_exact(&meta_types)?)
        } else {
            None
        };

        let id = ArchetypeId::from_raw(self.archetypes.len() as u32);
        let archetype = Archetype::new(id, types.clone(), &self.components, meta)?;
        trace!(?id, types = types.len(), capacity = archetype.chunk_capacity(), "created archetype");
        self.archetypes.push(archetype);
        self.archetype_index.insert(types, id);
        Ok(id)
    }

    /// Get an archetype by ID.
    #[must_use]
    pub fn archetype_info(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.as_raw() as usize)
    }

    /// All archetypes in creation order.
    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    fn archetype_ref(&self, id: ArchetypeId) -> EcsResult<&Archetype> {
        self.archetype_info(id).ok_or(EcsError::UnknownArchetype(id))
    }

    // ==================== Entities ====================

    /// Spawn an entity with default (zeroed) values.
    pub fn spawn(&mut self, archetype: ArchetypeId) -> EcsResult<Entity> {
        let shared: SmallVec<[u32; 4]> =
            smallvec![0; self.archetype_ref(archetype)?.shared_types().len()];
        self.spawn_in(archetype, &shared)
    }

    fn spawn_in(&mut self, archetype: ArchetypeId, shared: &[u32]) -> EcsResult<Entity> {
        let chunk = self.chunk_with_space(archetype, shared)?;
        let row = self.archetypes[archetype.as_raw() as usize].chunks[chunk as usize].count;
        let entity = self.entities.allocate(EntityLocation {
            archetype,
            chunk,
            row,
        });
        self.push_row(archetype, chunk);
        self.init_row(archetype, chunk, row, entity);
        Ok(entity)
    }

    /// Despawn an entity, releasing its buffers and managed values.
    ///
    /// Returns `true` if the entity was alive.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let Some(location) = self.entities.location(entity) else {
            return false;
        };
        self.release_row(location);
        self.entities.deallocate(entity);
        self.remove_row(location);
        true
    }

    /// Check if an entity is alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Get the number of live entities.
    #[must_use]
    pub fn entity_count(&self) -> u32 {
        self.entities.alive_count()
    }

    /// Where an entity is stored.
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.location(entity)
    }

    /// Iterate live entities in archetype, chunk, row order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.archetypes.iter().flat_map(move |archetype| {
            archetype.chunks.iter().flat_map(move |chunk| {
                let memory = self.pool.bytes(chunk.slot);
                (0..chunk.count as usize).map(move |row| read_entity(memory, row))
            })
        })
    }

    // ==================== Plain components ====================

    /// Check if an entity has a component type.
    #[must_use]
    pub fn has<T: 'static>(&self, entity: Entity) -> bool {
        let (Some(id), Some(location)) = (self.component_id::<T>(), self.entities.location(entity))
        else {
            return false;
        };
        self.archetypes[location.archetype.as_raw() as usize].contains(id)
    }

    /// Get a copy of a component value.
    #[must_use]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<T> {
        let id = self.component_id::<T>()?;
        let bytes = self.component_bytes(entity, id, ComponentKind::Data)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Overwrite a component value.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        let Some(id) = self.component_id::<T>() else {
            return false;
        };
        self.write_component(entity, id, bytemuck::bytes_of(&value))
    }

    /// Raw bytes of an in-chunk value.
    fn component_bytes(&self, entity: Entity, id: ComponentId, kind: ComponentKind) -> Option<&[u8]> {
        let location = self.entities.location(entity)?;
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let (pos, layout) = archetype.column(id)?;
        if archetype.columns()[pos].kind != kind {
            return None;
        }
        let chunk = &archetype.chunks[location.chunk as usize];
        Some(&self.pool.bytes(chunk.slot)[layout.row_range(location.row as usize)])
    }

    fn component_bytes_mut(&mut self, entity: Entity, id: ComponentId) -> Option<(ColumnLayout, &mut [u8])> {
        let location = self.entities.location(entity)?;
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let (_, layout) = archetype.column(id)?;
        let slot = archetype.chunks[location.chunk as usize].slot;
        let range = layout.row_range(location.row as usize);
        Some((layout, &mut self.pool.bytes_mut(slot)[range]))
    }

    /// Overwrite the in-chunk bytes of a plain-data value.
    pub fn write_component(&mut self, entity: Entity, id: ComponentId, bytes: &[u8]) -> bool {
        let is_data = self
            .components
            .get_info(id)
            .is_some_and(|info| info.kind() == ComponentKind::Data);
        if !is_data {
            return false;
        }
        match self.component_bytes_mut(entity, id) {
            Some((_, slot)) if slot.len() == bytes.len() => {
                slot.copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    // ==================== Enable bits ====================

    /// Enable or disable an enableable component on one entity.
    pub fn set_enabled<T: 'static>(&mut self, entity: Entity, enabled: bool) -> bool {
        match self.component_id::<T>() {
            Some(id) => self.set_enabled_by_id(entity, id, enabled),
            None => false,
        }
    }

    /// Enable or disable an enableable component by ID.
    pub fn set_enabled_by_id(&mut self, entity: Entity, id: ComponentId, enabled: bool) -> bool {
        let Some(location) = self.entities.location(entity) else {
            return false;
        };
        let archetype = &mut self.archetypes[location.archetype.as_raw() as usize];
        let Some(group) = archetype.enable_slot(id) else {
            return false;
        };
        let chunk = &mut archetype.chunks[location.chunk as usize];
        let bit = 1u128 << location.row;
        if enabled {
            chunk.enabled[group] |= bit;
        } else {
            chunk.enabled[group] &= !bit;
        }
        chunk.disabled[group] = count_disabled(chunk.enabled[group], chunk.count);
        true
    }

    /// Whether an enableable component is enabled on an entity.
    #[must_use]
    pub fn is_enabled<T: 'static>(&self, entity: Entity) -> Option<bool> {
        let id = self.component_id::<T>()?;
        let location = self.entities.location(entity)?;
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let group = archetype.enable_slot(id)?;
        let bits = archetype.chunks[location.chunk as usize].enabled[group];
        Some(bits & (1u128 << location.row) != 0)
    }

    // ==================== Dynamic buffers ====================

    fn buffer_column(&self, entity: Entity, id: ComponentId) -> Option<(ChunkSlot, std::ops::Range<usize>, usize)> {
        let location = self.entities.location(entity)?;
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let (pos, layout) = archetype.column(id)?;
        let column = archetype.columns()[pos];
        if !matches!(column.kind, ComponentKind::Buffer { .. }) {
            return None;
        }
        let slot = archetype.chunks[location.chunk as usize].slot;
        Some((slot, layout.row_range(location.row as usize), column.element_size as usize))
    }

    /// Header of an entity's buffer.
    #[must_use]
    pub fn buffer_header<T: Component>(&self, entity: Entity) -> Option<BufferHeader> {
        let (slot, range, _) = self.buffer_column(entity, self.component_id::<T>()?)?;
        let memory = &self.pool.bytes(slot)[range];
        Some(bytemuck::pod_read_unaligned(&memory[..BUFFER_HEADER_SIZE]))
    }

    /// Copy out an entity's buffer elements.
    #[must_use]
    pub fn buffer<T: Component>(&self, entity: Entity) -> Option<Vec<T>> {
        let (slot, range, element) = self.buffer_column(entity, self.component_id::<T>()?)?;
        let memory = &self.pool.bytes(slot)[range];
        let header: BufferHeader = bytemuck::pod_read_unaligned(&memory[..BUFFER_HEADER_SIZE]);
        let len = header.length as usize * element;
        let data = if header.is_spilled() {
            self.buffers.get(header.pointer)?.get(..len)?
        } else {
            memory.get(BUFFER_HEADER_SIZE..BUFFER_HEADER_SIZE + len)?
        };
        Some(
            data.chunks_exact(element.max(1))
                .take(header.length as usize)
                .map(bytemuck::pod_read_unaligned)
                .collect(),
        )
    }

    /// Append an element, spilling to the heap when inline capacity runs out.
    pub fn buffer_push<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        let Some(id) = self.component_id::<T>() else {
            return false;
        };
        let Some((slot, range, element)) = self.buffer_column(entity, id) else {
            return false;
        };

        let memory = &mut self.pool.bytes_mut(slot)[range];
        let mut header: BufferHeader = bytemuck::pod_read_unaligned(&memory[..BUFFER_HEADER_SIZE]);

        if header.length >= header.capacity {
            let new_capacity = (header.capacity.max(1) * 2) as usize;
            let mut heap = vec![0u8; new_capacity * element];
            let used = header.length as usize * element;
            if header.is_spilled() {
                if let Some(old) = self.buffers.get(header.pointer) {
                    heap[..used].copy_from_slice(&old[..used]);
                }
                self.buffers.free(header.pointer);
            } else {
                heap[..used].copy_from_slice(&memory[BUFFER_HEADER_SIZE..BUFFER_HEADER_SIZE + used]);
            }
            header.pointer = self.buffers.insert(heap.into_boxed_slice());
            header.capacity = new_capacity as i32;
        }

        let at = header.length as usize * element;
        let bytes = bytemuck::bytes_of(&value);
        if header.is_spilled() {
            let Some(heap) = self.buffers.get_mut(header.pointer) else {
                return false;
            };
            heap[at..at + element].copy_from_slice(bytes);
        } else {
            let start = BUFFER_HEADER_SIZE + at;
            memory[start..start + element].copy_from_slice(bytes);
        }
        header.length += 1;
        memory[..BUFFER_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        true
    }

    /// Remove all elements, returning spilled storage to the heap.
    pub fn buffer_clear<T: Component>(&mut self, entity: Entity) -> bool {
        let Some(id) = self.component_id::<T>() else {
            return false;
        };
        let Some((slot, range, _)) = self.buffer_column(entity, id) else {
            return false;
        };
        let Some(ComponentKind::Buffer { inline_capacity }) =
            self.components.get_info(id).map(ComponentInfo::kind)
        else {
            return false;
        };
        let memory = &mut self.pool.bytes_mut(slot)[range];
        let header: BufferHeader = bytemuck::pod_read_unaligned(&memory[..BUFFER_HEADER_SIZE]);
        if header.is_spilled() {
            self.buffers.free(header.pointer);
        }
        memory.fill(0);
        let cleared = BufferHeader {
            pointer: 0,
            length: 0,
            capacity: inline_capacity as i32,
        };
        memory[..BUFFER_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&cleared));
        true
    }

    // ==================== Shared components ====================

    /// Shared component index of an entity's chunk; 0 is the default value.
    #[must_use]
    pub fn shared_index(&self, entity: Entity, id: ComponentId) -> Option<u32> {
        let location = self.entities.location(entity)?;
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let slot = archetype.shared_slot(id)?;
        Some(archetype.chunks[location.chunk as usize].shared[slot])
    }

    /// Set a plain shared value, moving the entity to a matching chunk.
    pub fn set_shared<T: Component>(&mut self, entity: Entity, value: T) -> EcsResult<()> {
        let id = self.id_of::<T>()?;
        self.expect_kind(id, ComponentKind::Shared)?;
        let index = self.shared.insert_unmanaged(id, bytemuck::bytes_of(&value));
        let moved = self.move_to_shared(entity, id, index);
        self.shared.release(index);
        moved
    }

    /// Get a plain shared value; the default index reads as zeroed.
    #[must_use]
    pub fn get_shared<T: Component>(&self, entity: Entity) -> Option<T> {
        let index = self.shared_index(entity, self.component_id::<T>()?)?;
        if index == 0 {
            return Some(T::zeroed());
        }
        match self.shared.get(index)?.value() {
            SharedValue::Unmanaged(bytes) => Some(bytemuck::pod_read_unaligned(bytes)),
            SharedValue::Managed(_) => None,
        }
    }

    /// Set a managed shared value, moving the entity to a matching chunk.
    pub fn set_shared_managed<T: ManagedComponent>(&mut self, entity: Entity, value: T) -> EcsResult<()> {
        let id = self.id_of::<T>()?;
        self.expect_kind(id, ComponentKind::SharedManaged)?;
        let index = self.shared.insert_managed(id, Box::new(value));
        let moved = self.move_to_shared(entity, id, index);
        self.shared.release(index);
        moved
    }

    /// Get a managed shared value; `None` for the default index.
    #[must_use]
    pub fn get_shared_managed<T: ManagedComponent>(&self, entity: Entity) -> Option<T> {
        let index = self.shared_index(entity, self.component_id::<T>()?)?;
        match self.shared.get(index)?.value() {
            SharedValue::Managed(value) => value.as_any().downcast_ref::<T>().cloned(),
            SharedValue::Unmanaged(_) => None,
        }
    }

    fn expect_kind(&self, id: ComponentId, kind: ComponentKind) -> EcsResult<()> {
        let info = self.components.info(id)?;
        if info.kind() == kind {
            Ok(())
        } else {
            Err(EcsError::WrongKind {
                name: info.name(),
                expected: kind_name(kind),
            })
        }
    }

    fn move_to_shared(&mut self, entity: Entity, id: ComponentId, index: u32) -> EcsResult<()> {
        let from = self.entities.location(entity).ok_or(EcsError::NoSuchEntity(entity))?;
        let archetype_id = from.archetype;
        let archetype = &self.archetypes[archetype_id.as_raw() as usize];
        let slot = archetype.shared_slot(id).ok_or_else(|| EcsError::WrongKind {
            name: self.components.get_info(id).map_or("?", ComponentInfo::name),
            expected: "member",
        })?;

        let mut shared = archetype.chunks[from.chunk as usize].shared.clone();
        if shared[slot] == index {
            return Ok(());
        }
        shared[slot] = index;

        let target = self.chunk_with_space(archetype_id, &shared)?;
        let row = self.archetypes[archetype_id.as_raw() as usize].chunks[target as usize].count;
        self.push_row(archetype_id, target);
        self.copy_row(archetype_id, (from.chunk, from.row), (target, row));
        self.entities.set_location(
            entity,
            EntityLocation {
                archetype: archetype_id,
                chunk: target,
                row,
            },
        );
        self.remove_row(from);
        Ok(())
    }

    // ==================== Managed components ====================

    fn managed_slot(&self, entity: Entity, id: ComponentId) -> Option<u32> {
        let bytes = self.component_bytes(entity, id, ComponentKind::Managed)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Set a managed component value.
    pub fn set_managed<T: ManagedComponent>(&mut self, entity: Entity, value: T) -> bool {
        let Some(id) = self.component_id::<T>() else {
            return false;
        };
        let Some(index) = self.managed_slot(entity, id) else {
            return false;
        };
        if index != 0 && self.managed.replace(index, Box::new(value.clone())) {
            return true;
        }
        let index = self.managed.insert(Box::new(value));
        match self.component_bytes_mut(entity, id) {
            Some((_, slot)) => {
                slot.copy_from_slice(&index.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Get a copy of a managed component value.
    #[must_use]
    pub fn get_managed<T: ManagedComponent>(&self, entity: Entity) -> Option<T> {
        let index = self.managed_slot(entity, self.component_id::<T>()?)?;
        self.managed.get(index)?.as_any().downcast_ref::<T>().cloned()
    }

    // ==================== Chunk components ====================

    /// The meta entity of an entity's chunk, if its archetype has chunk components.
    #[must_use]
    pub fn meta_entity(&self, entity: Entity) -> Option<Entity> {
        let location = self.entities.location(entity)?;
        let chunk = &self.archetypes[location.archetype.as_raw() as usize].chunks[location.chunk as usize];
        let header = ChunkHeader::read(self.pool.bytes(chunk.slot));
        (!header.meta_entity.is_null()).then_some(header.meta_entity)
    }

    /// Set a chunk component on the chunk holding `entity`.
    pub fn set_chunk_component<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        match self.meta_entity(entity) {
            Some(meta) => self.set(meta, value),
            None => false,
        }
    }

    /// Get a chunk component of the chunk holding `entity`.
    #[must_use]
    pub fn get_chunk_component<T: Component>(&self, entity: Entity) -> Option<T> {
        self.get(self.meta_entity(entity)?)
    }

    // ==================== Blobs ====================

    /// Create a blob asset owned by the world.
    pub fn create_blob(&mut self, payload: &[u8]) -> BlobAssetReference {
        self.blobs.create(payload).1
    }

    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // ==================== Store access ====================

    /// Memory of a chunk.
    #[must_use]
    pub fn chunk_memory(&self, chunk: &Chunk) -> &[u8] {
        self.pool.bytes(chunk.slot)
    }

    #[must_use]
    pub fn shared_components(&self) -> &SharedComponentStore {
        &self.shared
    }

    #[must_use]
    pub fn managed_components(&self) -> &ManagedStore {
        &self.managed
    }

    #[must_use]
    pub fn buffer_heap(&self) -> &BufferHeap {
        &self.buffers
    }

    // ==================== Bulk restore ====================

    /// Hand out zeroed memory for up to `requested` chunks.
    ///
    /// May return fewer chunks than requested; callers loop until covered.
    #[must_use]
    pub fn allocate_chunk_block(&self, requested: usize) -> ChunkBlock {
        ChunkBlock::zeroed(requested.min(MAX_CHUNKS_PER_BLOCK))
    }

    /// Take ownership of a filled block; one slot per chunk, in order.
    pub fn adopt_chunk_block(&mut self, block: ChunkBlock) -> Vec<ChunkSlot> {
        self.pool.adopt(block)
    }

    /// Reserve entities `(0..count, version 1)` in an empty world.
    ///
    /// Each reserved entity becomes alive once an installed chunk holds it.
    pub fn reserve_entities_exact(&mut self, count: u32) -> EcsResult<()> {
        let occupied = self.archetypes.iter().any(|a| !a.chunks.is_empty());
        if self.entities.alive_count() != 0 || occupied {
            return Err(EcsError::NotEmpty {
                entities: self.entities.alive_count(),
            });
        }
        self.entities.reset_dense(count);
        Ok(())
    }

    /// Register restored chunk memory with an archetype.
    ///
    /// The chunk's rows must hold entities reserved with
    /// [`Self::reserve_entities_exact`]. Shared indices and the blob owner gain
    /// one reference held by the chunk. Returns the chunk's list index.
    pub fn install_chunk(
        &mut self,
        archetype_id: ArchetypeId,
        slot: ChunkSlot,
        install: ChunkInstall,
    ) -> EcsResult<u32> {
        let archetype = self.archetype_ref(archetype_id)?;
        let mut header = ChunkHeader::read(self.pool.bytes(slot));
        let capacity = archetype.chunk_capacity();

        if header.count == 0 || header.count as usize > capacity {
            return Err(EcsError::InvalidChunk(format!(
                "{} entities in a chunk of capacity {}",
                header.count, capacity
            )));
        }
        if header.capacity as usize != capacity {
            return Err(EcsError::InvalidChunk(format!(
                "layout capacity {} differs from runtime capacity {}",
                header.capacity, capacity
            )));
        }
        if install.shared.len() != archetype.shared_types().len()
            || install.enabled.len() != archetype.enableable_types().len()
            || install.disabled.len() != install.enabled.len()
        {
            return Err(EcsError::InvalidChunk(String::from(
                "shared or enable-bit arrays do not match the archetype",
            )));
        }

        let chunk_index = archetype.chunks.len() as u32;
        for row in 0..header.count {
            let entity = read_entity(self.pool.bytes(slot), row as usize);
            let location = EntityLocation {
                archetype: archetype_id,
                chunk: chunk_index,
                row,
            };
            if !self.entities.place(entity, location) {
                return Err(EcsError::InvalidChunk(format!(
                    "row {row} holds unreserved or duplicate entity {entity:?}"
                )));
            }
        }

        for &index in &install.shared {
            self.shared.retain(index);
        }
        let mut blob_owners = SmallVec::new();
        if let Some(owner) = install.blob_owner {
            if self.blobs.retain(owner) {
                blob_owners.push(owner);
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        header.archetype = archetype_id.as_raw();
        header.list_index = chunk_index;
        header.sequence = sequence;
        header.write(self.pool.bytes_mut(slot));

        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        archetype.entity_count += header.count;
        archetype.chunks.push(Chunk {
            slot,
            count: header.count,
            shared: install.shared,
            enabled: install.enabled,
            disabled: install.disabled,
            sequence,
            blob_owners,
        });
        trace!(archetype = ?archetype_id, chunk = chunk_index, count = header.count, "installed chunk");
        Ok(chunk_index)
    }

    /// Point a meta entity at the chunk it describes.
    pub fn set_chunk_link(&mut self, meta_entity: Entity, link: ChunkLink) -> bool {
        self.write_component(meta_entity, ComponentId::CHUNK_LINK, bytemuck::bytes_of(&link))
    }

    /// Insert a plain shared value; the caller receives one reference.
    pub fn insert_shared_unmanaged(&mut self, id: ComponentId, bytes: &[u8]) -> EcsResult<u32> {
        self.expect_kind(id, ComponentKind::Shared)?;
        let info = self.components.info(id)?;
        if info.size() != bytes.len() {
            return Err(EcsError::SizeMismatch {
                name: info.name(),
                expected: info.size(),
                actual: bytes.len(),
            });
        }
        Ok(self.shared.insert_unmanaged(id, bytes))
    }

    /// Insert a managed shared value; the caller receives one reference.
    pub fn insert_shared_managed(&mut self, id: ComponentId, value: Box<dyn ManagedObject>) -> EcsResult<u32> {
        self.expect_kind(id, ComponentKind::SharedManaged)?;
        Ok(self.shared.insert_managed(id, value))
    }

    /// Drop a reference obtained from one of the shared inserts.
    pub fn release_shared(&mut self, index: u32) {
        self.shared.release(index);
    }

    /// Store a managed value; the returned index goes in a managed column.
    pub fn insert_managed(&mut self, value: Box<dyn ManagedObject>) -> u32 {
        self.managed.insert(value)
    }

    /// Store spilled buffer contents; the handle goes in a buffer header.
    pub fn insert_buffer_heap(&mut self, bytes: Box<[u8]>) -> u64 {
        self.buffers.insert(bytes)
    }

    /// Take ownership of a blob batch, held with one reference.
    pub fn insert_blob_batch(&mut self, data: Vec<u8>) -> (BlobBatchId, u64) {
        self.blobs.insert_batch(data)
    }

    /// Drop a reference to a blob allocation.
    pub fn release_blob_batch(&mut self, id: BlobBatchId) -> bool {
        self.blobs.release(id)
    }

    // ==================== Chunk internals ====================

    fn chunk_with_space(&mut self, archetype_id: ArchetypeId, shared: &[u32]) -> EcsResult<u32> {
        let archetype = self.archetype_ref(archetype_id)?;
        let capacity = archetype.chunk_capacity() as u32;
        if let Some(index) = archetype
            .chunks
            .iter()
            .position(|chunk| chunk.count < capacity && chunk.shared.as_slice() == shared)
        {
            return Ok(index as u32);
        }
        self.create_chunk(archetype_id, shared)
    }

    fn create_chunk(&mut self, archetype_id: ArchetypeId, shared: &[u32]) -> EcsResult<u32> {
        let slot = self.pool.allocate();
        for &index in shared {
            self.shared.retain(index);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        let chunk_index = archetype.chunks.len() as u32;
        let groups = archetype.enableable_types().len();
        archetype.chunks.push(Chunk {
            slot,
            count: 0,
            shared: shared.into(),
            enabled: smallvec![0; groups],
            disabled: smallvec![0; groups],
            sequence,
            blob_owners: SmallVec::new(),
        });
        let mut header = ChunkHeader {
            archetype: archetype_id.as_raw(),
            capacity: archetype.chunk_capacity() as u32,
            list_index: chunk_index,
            sequence,
            ..ChunkHeader::default()
        };

        if let Some(meta) = archetype.meta_archetype() {
            let meta_entity = self.spawn(meta)?;
            self.set_chunk_link(
                meta_entity,
                ChunkLink {
                    archetype: archetype_id.as_raw(),
                    chunk: chunk_index,
                },
            );
            header.meta_entity = meta_entity;
        }
        header.write(self.pool.bytes_mut(slot));
        trace!(archetype = ?archetype_id, chunk = chunk_index, "created chunk");
        Ok(chunk_index)
    }

    /// Claim the next row of a chunk.
    fn push_row(&mut self, archetype_id: ArchetypeId, chunk_index: u32) {
        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        archetype.entity_count += 1;
        let chunk = &mut archetype.chunks[chunk_index as usize];
        chunk.count += 1;
        let count = chunk.count;
        let slot = chunk.slot;
        write_count(self.pool.bytes_mut(slot), count);
    }

    /// Fill a freshly pushed row with default values.
    fn init_row(&mut self, archetype_id: ArchetypeId, chunk_index: u32, row: u32, entity: Entity) {
        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        let chunk = &mut archetype.chunks[chunk_index as usize];
        for (bits, disabled) in chunk.enabled.iter_mut().zip(chunk.disabled.iter_mut()) {
            *bits |= 1u128 << row;
            *disabled = count_disabled(*bits, chunk.count);
        }
        let memory = self.pool.bytes_mut(chunk.slot);

        for column in archetype.columns() {
            let Some(layout) = column.layout else {
                continue;
            };
            let range = layout.row_range(row as usize);
            memory[range.clone()].fill(0);
            match column.kind {
                ComponentKind::Entity => {
                    memory[range].copy_from_slice(bytemuck::bytes_of(&entity));
                }
                ComponentKind::Buffer { inline_capacity } => {
                    let header = BufferHeader {
                        pointer: 0,
                        length: 0,
                        capacity: inline_capacity as i32,
                    };
                    memory[range.start..range.start + BUFFER_HEADER_SIZE]
                        .copy_from_slice(bytemuck::bytes_of(&header));
                }
                _ => {}
            }
        }
    }

    /// Free per-row resources held outside chunk memory.
    fn release_row(&mut self, location: EntityLocation) {
        let archetype = &self.archetypes[location.archetype.as_raw() as usize];
        let memory = self.pool.bytes(archetype.chunks[location.chunk as usize].slot);
        let mut heap = SmallVec::<[u64; 4]>::new();
        let mut managed = SmallVec::<[u32; 4]>::new();
        for column in archetype.columns() {
            let Some(layout) = column.layout else {
                continue;
            };
            let range = layout.row_range(location.row as usize);
            match column.kind {
                ComponentKind::Buffer { .. } => {
                    let header: BufferHeader =
                        bytemuck::pod_read_unaligned(&memory[range.start..range.start + BUFFER_HEADER_SIZE]);
                    if header.is_spilled() {
                        heap.push(header.pointer);
                    }
                }
                ComponentKind::Managed => {
                    managed.push(bytemuck::pod_read_unaligned(&memory[range]));
                }
                _ => {}
            }
        }
        for handle in heap {
            self.buffers.free(handle);
        }
        for index in managed.into_iter().filter(|&i| i != 0) {
            self.managed.remove(index);
        }
    }

    /// Copy a row between two chunks of the same archetype.
    ///
    /// Ownership of buffers and managed values moves with the bytes.
    fn copy_row(&mut self, archetype_id: ArchetypeId, from: (u32, u32), to: (u32, u32)) {
        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        let source_slot = archetype.chunks[from.0 as usize].slot;
        let target_slot = archetype.chunks[to.0 as usize].slot;

        let mut scratch = Vec::new();
        for column in archetype.columns() {
            let Some(layout) = column.layout else {
                continue;
            };
            scratch.clear();
            scratch.extend_from_slice(&self.pool.bytes(source_slot)[layout.row_range(from.1 as usize)]);
            self.pool.bytes_mut(target_slot)[layout.row_range(to.1 as usize)].copy_from_slice(&scratch);
        }

        let source = archetype.chunks[from.0 as usize].clone();
        let target = &mut archetype.chunks[to.0 as usize];
        for (group, bits) in source.enabled.iter().enumerate() {
            if bits & (1u128 << from.1) != 0 {
                target.enabled[group] |= 1u128 << to.1;
            } else {
                target.enabled[group] &= !(1u128 << to.1);
            }
            target.disabled[group] = count_disabled(target.enabled[group], target.count);
        }
        for &owner in &source.blob_owners {
            if !target.blob_owners.contains(&owner) && self.blobs.retain(owner) {
                target.blob_owners.push(owner);
            }
        }
    }

    /// Swap-remove a row without touching resources it referenced.
    fn remove_row(&mut self, location: EntityLocation) {
        let archetype = &mut self.archetypes[location.archetype.as_raw() as usize];
        archetype.entity_count -= 1;
        let (slot, count) = {
            let chunk = &archetype.chunks[location.chunk as usize];
            (chunk.slot, chunk.count)
        };
        let row = location.row as usize;
        let last = count as usize - 1;
        let memory = self.pool.bytes_mut(slot);

        for column in archetype.columns() {
            let Some(layout) = column.layout else {
                continue;
            };
            let last_range = layout.row_range(last);
            if row != last {
                memory.copy_within(last_range.clone(), layout.row_range(row).start);
            }
            memory[last_range].fill(0);
        }
        let moved = (row != last).then(|| read_entity(memory, row));
        write_count(memory, last as u32);

        let chunk = &mut archetype.chunks[location.chunk as usize];
        chunk.count = last as u32;
        for (bits, disabled) in chunk.enabled.iter_mut().zip(chunk.disabled.iter_mut()) {
            if row != last {
                if *bits & (1u128 << last) != 0 {
                    *bits |= 1u128 << row;
                } else {
                    *bits &= !(1u128 << row);
                }
            }
            *bits &= !(1u128 << last);
            *disabled = count_disabled(*bits, last as u32);
        }

        if let Some(moved) = moved {
            self.entities.set_location(moved, location);
        }
        if last == 0 {
            self.free_chunk(location.archetype, location.chunk);
        }
    }

    fn free_chunk(&mut self, archetype_id: ArchetypeId, chunk_index: u32) {
        let archetype = &mut self.archetypes[archetype_id.as_raw() as usize];
        let chunk = archetype.chunks.swap_remove(chunk_index as usize);
        let relocated = archetype.chunks.get(chunk_index as usize).map(|c| (c.slot, c.count));

        for &index in &chunk.shared {
            self.shared.release(index);
        }
        for &owner in &chunk.blob_owners {
            self.blobs.release(owner);
        }
        let header = ChunkHeader::read(self.pool.bytes(chunk.slot));
        self.pool.free(chunk.slot);

        if let Some((slot, count)) = relocated {
            let mut moved_header = ChunkHeader::read(self.pool.bytes(slot));
            moved_header.list_index = chunk_index;
            moved_header.write(self.pool.bytes_mut(slot));
            for row in 0..count {
                let entity = read_entity(self.pool.bytes(slot), row as usize);
                self.entities.set_location(
                    entity,
                    EntityLocation {
                        archetype: archetype_id,
                        chunk: chunk_index,
                        row,
                    },
                );
            }
            if !moved_header.meta_entity.is_null() {
                self.set_chunk_link(
                    moved_header.meta_entity,
                    ChunkLink {
                        archetype: archetype_id.as_raw(),
                        chunk: chunk_index,
                    },
                );
            }
        }

        if !header.meta_entity.is_null() {
            self.despawn(header.meta_entity);
        }
        trace!(archetype = ?archetype_id, chunk = chunk_index, "freed chunk");
    }
}

/// Entity stored in row `row` of a chunk; the entity column is always first.
fn read_entity(chunk: &[u8], row: usize) -> Entity {
    let header_end = crate::chunk::CHUNK_HEADER_SIZE;
    let start = header_end + row * Entity::SIZE;
    bytemuck::pod_read_unaligned(&chunk[start..start + Entity::SIZE])
}

fn write_count(chunk: &mut [u8], count: u32) {
    let mut header = ChunkHeader::read(chunk);
    header.count = count;
    header.write(chunk);
}

const fn kind_name(kind: ComponentKind) -> &'static str {
    match kind {
        ComponentKind::Entity => "entity",
        ComponentKind::Data => "data",
        ComponentKind::Buffer { .. } => "buffer",
        ComponentKind::Shared => "shared",
        ComponentKind::Managed => "managed",
        ComponentKind::SharedManaged => "shared managed",
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use bytemuck::Pod;

    use super::*;
    use crate::object::{ObjectReader, ObjectResult, ObjectWriter, Persist};

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    impl Component for Health {
        const NAME: &'static str = "tests::Health";
        fn describe(d: TypeDescriptor) -> TypeDescriptor {
            d.enableable()
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Target {
        entity: Entity,
    }

    impl Component for Target {
        const NAME: &'static str = "tests::Target";
        fn describe(d: TypeDescriptor) -> TypeDescriptor {
            d.entity_field(offset_of!(Target, entity))
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Waypoint(u32);

    impl Component for Waypoint {
        const NAME: &'static str = "tests::Waypoint";
        const KIND: ComponentKind = ComponentKind::Buffer { inline_capacity: 2 };
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Team(u32);

    impl Component for Team {
        const NAME: &'static str = "tests::Team";
        const KIND: ComponentKind = ComponentKind::Shared;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Bounds(f32);

    impl Component for Bounds {
        const NAME: &'static str = "tests::Bounds";
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Label(String);

    impl Persist for Label {
        fn write(&self, writer: &mut ObjectWriter<'_>) -> ObjectResult<()> {
            writer.write(&self.0)
        }

        fn read(reader: &mut ObjectReader<'_>) -> ObjectResult<Self> {
            Ok(Self(reader.read()?))
        }
    }

    impl ManagedComponent for Label {
        const NAME: &'static str = "tests::Label";
    }

    #[test]
    fn test_spawn_get_set() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[health]).unwrap();

        let e1 = world.spawn(archetype).unwrap();
        let e2 = world.spawn(archetype).unwrap();
        assert!(world.set(e1, Health(10)));
        assert!(world.set(e2, Health(20)));

        assert_eq!(world.get::<Health>(e1), Some(Health(10)));
        assert_eq!(world.get::<Health>(e2), Some(Health(20)));
        assert_eq!(world.entity_count(), 2);
        assert!(world.has::<Health>(e1));
        assert!(!world.has::<Target>(e1));
    }

    #[test]
    fn test_despawn_swaps_last_row() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[health]).unwrap();

        let entities: Vec<Entity> = (0..3).map(|_| world.spawn(archetype).unwrap()).collect();
        for (i, &entity) in entities.iter().enumerate() {
            world.set(entity, Health(i as u32));
        }

        assert!(world.despawn(entities[0]));
        assert!(!world.is_alive(entities[0]));
        assert_eq!(world.get::<Health>(entities[2]), Some(Health(2)));
        assert_eq!(world.location(entities[2]).unwrap().row, 0);

        assert!(world.despawn(entities[1]));
        assert!(world.despawn(entities[2]));
        assert!(world.archetype_info(archetype).unwrap().chunks().is_empty());
        assert_eq!(world.entities().count(), 0);
    }

    #[test]
    fn test_chunks_fill_up() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[health]).unwrap();
        let capacity = world.archetype_info(archetype).unwrap().chunk_capacity();

        for _ in 0..=capacity {
            world.spawn(archetype).unwrap();
        }
        let info = world.archetype_info(archetype).unwrap();
        assert_eq!(info.chunks().len(), 2);
        assert_eq!(info.entity_count() as usize, capacity + 1);
        assert_eq!(world.entities().count(), capacity + 1);
    }

    #[test]
    fn test_enable_bits() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[health]).unwrap();
        let e1 = world.spawn(archetype).unwrap();
        let e2 = world.spawn(archetype).unwrap();

        assert_eq!(world.is_enabled::<Health>(e1), Some(true));
        assert!(world.set_enabled::<Health>(e1, false));
        assert_eq!(world.is_enabled::<Health>(e1), Some(false));

        let chunk = &world.archetype_info(archetype).unwrap().chunks()[0];
        assert_eq!(chunk.disabled_counts(), &[1]);

        // Disabled state follows the row when another entity is despawned
        world.set_enabled::<Health>(e2, false);
        world.set_enabled::<Health>(e1, true);
        world.despawn(e1);
        assert_eq!(world.is_enabled::<Health>(e2), Some(false));
    }

    #[test]
    fn test_buffer_spills_to_heap() {
        let mut world = World::new();
        let waypoint = world.register::<Waypoint>().unwrap();
        let archetype = world.archetype(&[waypoint]).unwrap();
        let entity = world.spawn(archetype).unwrap();

        world.buffer_push(entity, Waypoint(1));
        world.buffer_push(entity, Waypoint(2));
        assert!(!world.buffer_header::<Waypoint>(entity).unwrap().is_spilled());

        world.buffer_push(entity, Waypoint(3));
        let header = world.buffer_header::<Waypoint>(entity).unwrap();
        assert!(header.is_spilled());
        assert_eq!(header.length, 3);
        assert_eq!(header.capacity, 4);
        assert_eq!(
            world.buffer::<Waypoint>(entity).unwrap(),
            vec![Waypoint(1), Waypoint(2), Waypoint(3)]
        );
        assert_eq!(world.buffer_heap().len(), 1);

        world.despawn(entity);
        assert!(world.buffer_heap().is_empty());
    }

    #[test]
    fn test_shared_component_moves_entity() {
        let mut world = World::new();
        let team = world.register::<Team>().unwrap();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[team, health]).unwrap();

        let e1 = world.spawn(archetype).unwrap();
        let e2 = world.spawn(archetype).unwrap();
        world.set(e1, Health(1));
        world.set(e2, Health(2));
        assert_eq!(world.get_shared::<Team>(e1), Some(Team(0)));

        world.set_shared(e1, Team(7)).unwrap();
        assert_eq!(world.get_shared::<Team>(e1), Some(Team(7)));
        assert_eq!(world.get_shared::<Team>(e2), Some(Team(0)));
        assert_eq!(world.get::<Health>(e1), Some(Health(1)));
        assert_eq!(world.archetype_info(archetype).unwrap().chunks().len(), 2);

        world.set_shared(e2, Team(7)).unwrap();
        assert_eq!(world.archetype_info(archetype).unwrap().chunks().len(), 1);
        assert_eq!(world.get::<Health>(e2), Some(Health(2)));
        assert_eq!(world.shared_components().len(), 1);

        world.despawn(e1);
        world.despawn(e2);
        assert!(world.shared_components().is_empty());
    }

    #[test]
    fn test_managed_component() {
        let mut world = World::new();
        let label = world.register_managed::<Label>().unwrap();
        let archetype = world.archetype(&[label]).unwrap();
        let entity = world.spawn(archetype).unwrap();

        assert_eq!(world.get_managed::<Label>(entity), None);
        assert!(world.set_managed(entity, Label("a".into())));
        assert!(world.set_managed(entity, Label("b".into())));
        assert_eq!(world.get_managed::<Label>(entity), Some(Label("b".into())));
        assert_eq!(world.managed_components().len(), 1);

        world.despawn(entity);
        assert!(world.managed_components().is_empty());
    }

    #[test]
    fn test_chunk_components_use_meta_entity() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let bounds = world.register::<Bounds>().unwrap();
        let archetype = world.archetype_with_chunk_components(&[health], &[bounds]).unwrap();

        let e1 = world.spawn(archetype).unwrap();
        let e2 = world.spawn(archetype).unwrap();
        let meta = world.meta_entity(e1).unwrap();
        assert_eq!(world.meta_entity(e2), Some(meta));
        assert_eq!(
            world.get::<ChunkLink>(meta),
            Some(ChunkLink {
                archetype: archetype.as_raw(),
                chunk: 0
            })
        );

        assert!(world.set_chunk_component(e1, Bounds(4.0)));
        assert_eq!(world.get_chunk_component::<Bounds>(e2), Some(Bounds(4.0)));

        world.despawn(e1);
        world.despawn(e2);
        assert!(!world.is_alive(meta));
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn test_entity_fields_are_plain_values() {
        let mut world = World::new();
        let target = world.register::<Target>().unwrap();
        let archetype = world.archetype(&[target]).unwrap();
        let a = world.spawn(archetype).unwrap();
        let b = world.spawn(archetype).unwrap();
        world.set(a, Target { entity: b });
        assert_eq!(world.get::<Target>(a), Some(Target { entity: b }));
        assert_eq!(world.get::<Target>(b), Some(Target { entity: Entity::NULL }));
    }

    #[test]
    fn test_install_chunk_requires_reservation() {
        let mut world = World::new();
        let health = world.register::<Health>().unwrap();
        let archetype = world.archetype(&[health]).unwrap();
        let capacity = world.archetype_info(archetype).unwrap().chunk_capacity();

        let mut block = world.allocate_chunk_block(1);
        let memory = block.chunk_mut(0);
        ChunkHeader {
            count: 2,
            capacity: capacity as u32,
            ..ChunkHeader::default()
        }
        .write(memory);
        for row in 0..2u32 {
            let start = crate::CHUNK_HEADER_SIZE + row as usize * Entity::SIZE;
            memory[start..start + Entity::SIZE].copy_from_slice(bytemuck::bytes_of(&Entity::new(row, 1)));
        }

        world.reserve_entities_exact(2).unwrap();
        let slots = world.adopt_chunk_block(block);
        let install = ChunkInstall {
            enabled: smallvec![0b11],
            disabled: smallvec![0],
            ..ChunkInstall::default()
        };
        world.install_chunk(archetype, slots[0], install).unwrap();

        assert!(world.is_alive(Entity::new(1, 1)));
        assert_eq!(world.entity_count(), 2);
        assert!(world.reserve_entities_exact(1).is_err());
        assert_eq!(world.is_enabled::<Health>(Entity::new(0, 1)), Some(true));
    }

    #[test]
    fn test_chunk_block_is_bounded() {
        let world = World::new();
        assert_eq!(world.allocate_chunk_block(1000).chunk_count(), MAX_CHUNKS_PER_BLOCK);
        assert_eq!(world.allocate_chunk_block(3).chunk_count(), 3);
    }
}
