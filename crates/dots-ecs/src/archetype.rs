//! Archetypes - unique combinations of component types and their chunks.
//!
//! Type order inside an archetype is canonical: the entity column first, then
//! by stable hash. Because layout depends only on that order and the types'
//! chunk strides, the same archetype has the same chunk layout in every world.

use std::fmt;

use smallvec::SmallVec;

use crate::{
    EcsError, EcsResult,
    chunk::{Chunk, ColumnLayout, compute_layout},
    component::{ComponentId, ComponentKind, ComponentRegistry, StableTypeHash},
};

/// Unique identifier for an archetype within one world.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    /// Create an archetype ID from a raw value.
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

/// One member type of an archetype.
///
/// A chunk component is stored once per chunk, on the chunk's meta entity,
/// rather than per entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArchetypeType {
    pub component: ComponentId,
    pub chunk_component: bool,
}

impl ArchetypeType {
    #[must_use]
    pub const fn new(component: ComponentId) -> Self {
        Self {
            component,
            chunk_component: false,
        }
    }

    #[must_use]
    pub const fn chunk(component: ComponentId) -> Self {
        Self {
            component,
            chunk_component: true,
        }
    }
}

/// Per-type layout information of an archetype.
#[derive(Clone, Copy, Debug)]
pub struct ArchetypeColumn {
    pub kind: ComponentKind,
    /// Size of one value or buffer element.
    pub element_size: u32,
    /// Placement in chunk memory; `None` for types stored elsewhere.
    pub layout: Option<ColumnLayout>,
}

/// Sort types into canonical order and reject malformed sets.
pub(crate) fn canonicalize(
    types: &[ArchetypeType],
    registry: &ComponentRegistry,
) -> EcsResult<SmallVec<[ArchetypeType; 8]>> {
    let mut keys = Vec::with_capacity(types.len());
    for ty in types {
        let info = registry.info(ty.component)?;
        keys.push((ty.component != ComponentId::ENTITY, info.stable_hash(), ty.chunk_component));
    }
    let mut order: Vec<usize> = (0..types.len()).collect();
    order.sort_by_key(|&i| keys[i]);
    let mut sorted: SmallVec<[ArchetypeType; 8]> = order.iter().map(|&i| types[i]).collect();
    sorted.dedup();

    if sorted.first() != Some(&ArchetypeType::new(ComponentId::ENTITY)) {
        return Err(EcsError::InvalidArchetype("the entity column must be present"));
    }
    for pair in sorted.windows(2) {
        if pair[0].component == pair[1].component {
            return Err(EcsError::InvalidArchetype(
                "a type cannot be both a chunk component and a regular component",
            ));
        }
    }
    for ty in sorted.iter().filter(|ty| ty.chunk_component) {
        let info = registry.info(ty.component)?;
        if info.kind() != ComponentKind::Data || ty.component == ComponentId::CHUNK_LINK {
            return Err(EcsError::InvalidArchetype(
                "chunk components must be plain data",
            ));
        }
    }
    Ok(sorted)
}

/// A set of entities sharing one component layout, stored in chunks.
pub struct Archetype {
    id: ArchetypeId,
    types: SmallVec<[ArchetypeType; 8]>,
    columns: SmallVec<[ArchetypeColumn; 8]>,
    hash: StableTypeHash,
    capacity: usize,
    /// Type positions of shared types, in order.
    shared: SmallVec<[usize; 2]>,
    /// Type positions of enableable in-chunk types, in order.
    enableable: SmallVec<[usize; 2]>,
    meta: Option<ArchetypeId>,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) entity_count: u32,
}

impl Archetype {
    /// Build an archetype from canonical types.
    pub(crate) fn new(
        id: ArchetypeId,
        types: SmallVec<[ArchetypeType; 8]>,
        registry: &ComponentRegistry,
        meta: Option<ArchetypeId>,
    ) -> EcsResult<Self> {
        let mut strides = SmallVec::<[Option<usize>; 8]>::new();
        let mut hash = StableTypeHash::of_name("archetype");
        let mut shared = SmallVec::new();
        let mut enableable = SmallVec::new();

        for (pos, ty) in types.iter().enumerate() {
            let info = registry.info(ty.component)?;
            hash = hash
                .combine(info.stable_hash().0)
                .combine(u64::from(ty.chunk_component));

            let in_chunk = info.kind().in_chunk() && !ty.chunk_component;
            strides.push(in_chunk.then(|| info.chunk_stride()));
            if info.kind().is_shared() && !ty.chunk_component {
                shared.push(pos);
            }
            if in_chunk && info.is_enableable() {
                enableable.push(pos);
            }
        }

        let (capacity, layouts) = compute_layout(&strides)?;
        let columns = types
            .iter()
            .zip(layouts)
            .map(|(ty, layout)| {
                let info = registry.info(ty.component)?;
                Ok(ArchetypeColumn {
                    kind: info.kind(),
                    element_size: info.size() as u32,
                    layout,
                })
            })
            .collect::<EcsResult<_>>()?;

        Ok(Self {
            id,
            types,
            columns,
            hash,
            capacity,
            shared,
            enableable,
            meta,
            chunks: Vec::new(),
            entity_count: 0,
        })
    }

    /// Get the archetype ID.
    #[must_use]
    pub const fn id(&self) -> ArchetypeId {
        self.id
    }

    /// Member types in canonical order.
    #[must_use]
    pub fn types(&self) -> &[ArchetypeType] {
        &self.types
    }

    /// Per-type layout, parallel to [`Self::types`].
    #[must_use]
    pub fn columns(&self) -> &[ArchetypeColumn] {
        &self.columns
    }

    /// Content hash over the member types; stable across worlds.
    #[must_use]
    pub const fn stable_hash(&self) -> StableTypeHash {
        self.hash
    }

    /// Rows per chunk.
    #[must_use]
    pub const fn chunk_capacity(&self) -> usize {
        self.capacity
    }

    /// Position of a regular (non chunk) member type.
    #[must_use]
    pub fn position(&self, component: ComponentId) -> Option<usize> {
        self.types
            .iter()
            .position(|ty| ty.component == component && !ty.chunk_component)
    }

    /// Check if this archetype contains a regular member type.
    #[must_use]
    pub fn contains(&self, component: ComponentId) -> bool {
        self.position(component).is_some()
    }

    /// Chunk memory placement of a member type.
    #[must_use]
    pub fn column(&self, component: ComponentId) -> Option<(usize, ColumnLayout)> {
        let pos = self.position(component)?;
        Some((pos, self.columns[pos].layout?))
    }

    /// Type positions of shared types; a chunk's shared indices follow this order.
    #[must_use]
    pub fn shared_types(&self) -> &[usize] {
        &self.shared
    }

    /// Index into a chunk's shared indices for `component`.
    #[must_use]
    pub fn shared_slot(&self, component: ComponentId) -> Option<usize> {
        let pos = self.position(component)?;
        self.shared.iter().position(|&p| p == pos)
    }

    /// Type positions of enableable types; a chunk's enable bits follow this order.
    #[must_use]
    pub fn enableable_types(&self) -> &[usize] {
        &self.enableable
    }

    /// Index into a chunk's enable-bit groups for `component`.
    #[must_use]
    pub fn enable_slot(&self, component: ComponentId) -> Option<usize> {
        let pos = self.position(component)?;
        self.enableable.iter().position(|&p| p == pos)
    }

    /// Archetype of this archetype's meta entities, if it has chunk components.
    #[must_use]
    pub const fn meta_archetype(&self) -> Option<ArchetypeId> {
        self.meta
    }

    /// Chunks in list order.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of entities across all chunks.
    #[must_use]
    pub const fn entity_count(&self) -> u32 {
        self.entity_count
    }

    /// Check if the archetype has no entities.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entity_count == 0
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("types", &self.types)
            .field("capacity", &self.capacity)
            .field("chunks", &self.chunks.len())
            .field("entities", &self.entity_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};

    use super::*;
    use crate::{Component, TypeDescriptor};

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Health(u32);

    impl Component for Health {
        const NAME: &'static str = "tests::Health";
        fn describe(d: TypeDescriptor) -> TypeDescriptor {
            d.enableable()
        }
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Team(u32);

    impl Component for Team {
        const NAME: &'static str = "tests::Team";
        const KIND: ComponentKind = ComponentKind::Shared;
    }

    fn registry() -> (ComponentRegistry, ComponentId, ComponentId) {
        let mut registry = ComponentRegistry::new();
        let health = registry.register::<Health>().unwrap();
        let team = registry.register::<Team>().unwrap();
        (registry, health, team)
    }

    #[test]
    fn test_canonical_order() {
        let (registry, health, team) = registry();
        let a = canonicalize(
            &[
                ArchetypeType::new(team),
                ArchetypeType::new(health),
                ArchetypeType::new(ComponentId::ENTITY),
            ],
            &registry,
        )
        .unwrap();
        let b = canonicalize(
            &[
                ArchetypeType::new(ComponentId::ENTITY),
                ArchetypeType::new(health),
                ArchetypeType::new(team),
                ArchetypeType::new(health),
            ],
            &registry,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(a[0].component, ComponentId::ENTITY);
    }

    #[test]
    fn test_entity_column_required() {
        let (registry, health, _) = registry();
        assert!(canonicalize(&[ArchetypeType::new(health)], &registry).is_err());
    }

    #[test]
    fn test_slots() {
        let (registry, health, team) = registry();
        let types = canonicalize(
            &[
                ArchetypeType::new(ComponentId::ENTITY),
                ArchetypeType::new(health),
                ArchetypeType::new(team),
            ],
            &registry,
        )
        .unwrap();
        let archetype = Archetype::new(ArchetypeId::from_raw(0), types, &registry, None).unwrap();

        assert_eq!(archetype.shared_slot(team), Some(0));
        assert_eq!(archetype.enable_slot(health), Some(0));
        assert!(archetype.column(team).is_none());
        assert!(archetype.column(health).is_some());
        assert_eq!(archetype.chunk_capacity(), crate::MAX_ENTITIES_PER_CHUNK);
    }
}
