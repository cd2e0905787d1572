//! Entity identifiers with versioned indices.
//!
//! Entities use a versioned index pattern to safely reuse slots while
//! detecting stale references. The all-zero bit pattern is [`Entity::NULL`],
//! so zero-initialised chunk memory never refers to a live entity.

use std::fmt;

use bytemuck::{Pod, Zeroable};

/// Raw entity index into the entity table.
pub type EntityId = u32;

/// A unique identifier for an entity in the world.
///
/// Stored verbatim inside chunk memory, so the layout is fixed:
/// `index` at offset 0, `version` at offset 4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Pod, Zeroable)]
#[repr(C)]
pub struct Entity {
    index: EntityId,
    version: u32,
}

impl Entity {
    /// The null entity. Never alive; versions start at 1.
    pub const NULL: Self = Self {
        index: 0,
        version: 0,
    };

    /// Size of an entity as stored in chunk memory.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create an entity from an index and version.
    #[must_use]
    pub const fn new(index: EntityId, version: u32) -> Self {
        Self { index, version }
    }

    /// Get the entity's index.
    #[must_use]
    pub const fn index(self) -> EntityId {
        self.index
    }

    /// Get the entity's version.
    #[must_use]
    pub const fn version(self) -> u32 {
        self.version
    }

    /// Whether this is the null entity.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == 0 && self.version == 0
    }

    /// Pack entity into a single u64.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.version as u64) << 32) | (self.index as u64)
    }

    /// Unpack entity from a u64.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            version: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Entity(null)");
        }
        write!(f, "Entity({}v{})", self.index, self.version)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.version)
    }
}

/// Where an entity's data lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// Archetype containing this entity.
    pub archetype: crate::ArchetypeId,
    /// Index into the archetype's chunk list.
    pub chunk: u32,
    /// Row within the chunk.
    pub row: u32,
}

#[derive(Clone, Copy, Debug)]
struct EntitySlot {
    version: u32,
    location: Option<EntityLocation>,
}

/// Allocator for entity slots with version tracking and locations.
///
/// Maintains a free list of recycled slots. A slot's version is bumped each
/// time it is freed so stale handles stop resolving.
#[derive(Default)]
pub struct EntityAllocator {
    slots: Vec<EntitySlot>,
    free_list: Vec<EntityId>,
    alive_count: u32,
}

impl EntityAllocator {
    /// Create a new entity allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    /// Allocate a new entity at the given location.
    pub fn allocate(&mut self, location: EntityLocation) -> Entity {
        self.alive_count += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.location = Some(location);
            Entity::new(index, slot.version)
        } else {
            let index = self.slots.len() as EntityId;
            self.slots.push(EntitySlot {
                version: 1,
                location: Some(location),
            });
            Entity::new(index, 1)
        }
    }

    /// Deallocate an entity, making its slot available for reuse.
    ///
    /// Returns `true` if the entity was alive.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = &mut self.slots[entity.index() as usize];
        slot.version = slot.version.wrapping_add(1).max(1);
        slot.location = None;
        self.free_list.push(entity.index());
        self.alive_count -= 1;
        true
    }

    /// Reset the allocator to exactly `count` live entities `(0..count, v1)`
    /// with no location yet. Locations are filled in with [`Self::set_location`].
    pub fn reset_dense(&mut self, count: u32) {
        self.slots.clear();
        self.free_list.clear();
        self.slots.resize(
            count as usize,
            EntitySlot {
                version: 1,
                location: None,
            },
        );
        self.alive_count = count;
    }

    /// Give a reserved entity its first location.
    ///
    /// Returns false if the slot does not exist, the version differs, or the
    /// entity was already placed.
    pub fn place(&mut self, entity: Entity, location: EntityLocation) -> bool {
        match self.slots.get_mut(entity.index() as usize) {
            Some(slot) if slot.version == entity.version() && slot.location.is_none() => {
                slot.location = Some(location);
                true
            }
            _ => false,
        }
    }

    /// Check if an entity is currently alive.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index() as usize)
            .is_some_and(|slot| slot.version == entity.version() && slot.location.is_some())
    }

    /// Get the location of a live entity.
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.slots.get(entity.index() as usize)?;
        if slot.version != entity.version() {
            return None;
        }
        slot.location
    }

    /// Update the location of an entity slot.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        if let Some(slot) = self.slots.get_mut(entity.index() as usize) {
            if slot.version == entity.version() {
                slot.location = Some(location);
            }
        }
    }

    /// Get the number of currently alive entities.
    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.alive_count
    }

    /// Get the total number of slots (including recycled ones).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
