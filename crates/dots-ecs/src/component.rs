//! Component type registration and metadata.
//!
//! Every component type is described by a [`TypeDescriptor`]: its stable
//! 64-bit hash, storage kind, size, and the byte offsets of fields that hold
//! runtime-only values (entities, blob asset references, weak asset
//! references). The descriptor is the only thing the persistence layer knows
//! about a type, so layouts never depend on runtime reflection.

use std::{any::TypeId, fmt, mem};

use bitflags::bitflags;
use bytemuck::Pod;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{
    EcsError, EcsResult,
    blob::BlobAssetReference,
    chunk::{BUFFER_HEADER_SIZE, ChunkLink},
    entity::Entity,
    managed::{ManagedComponent, ManagedObject},
    object::{ObjectError, ObjectReader, WeakAssetRef},
};

/// Unique identifier for a component type within one registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u32);

impl ComponentId {
    /// The built-in entity column present in every archetype.
    pub const ENTITY: Self = Self(0);
    /// The built-in component linking a meta entity to its chunk.
    pub const CHUNK_LINK: Self = Self(1);

    /// Create a component ID from a raw value.
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

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

/// Hash identifying a component type across processes and builds.
///
/// FNV-1a over the type's registered name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StableTypeHash(pub u64);

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

impl StableTypeHash {
    /// Hash a type name.
    #[must_use]
    pub const fn of_name(name: &str) -> Self {
        Self(fnv1a_continue(FNV_OFFSET, name.as_bytes()))
    }

    /// Fold another hash into this one, order-sensitive.
    #[must_use]
    pub const fn combine(self, other: u64) -> Self {
        Self(fnv1a_continue(self.0, &other.to_le_bytes()))
    }
}

impl fmt::Debug for StableTypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableTypeHash({:#018x})", self.0)
    }
}

impl fmt::Display for StableTypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// FNV-1a 64 over `bytes`.
#[must_use]
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a_continue(FNV_OFFSET, bytes)
}

const fn fnv1a_continue(mut hash: u64, bytes: &[u8]) -> u64 {
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

bitflags! {
    /// Behavioural flags attached to a component type.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Component carries a per-entity enable bit.
        const ENABLEABLE = 1 << 0;
        /// Runtime bookkeeping that is never persisted.
        const TRANSIENT = 1 << 1;
        /// Contains a raw native pointer; cannot be serialized.
        const NATIVE_POINTER = 1 << 2;
        /// Shared component explicitly allowed to carry entity references.
        const ALLOW_ENTITY_SERIALIZATION = 1 << 3;
        /// In-chunk slot whose contents are rebuilt on load.
        const CHUNK_LINK = 1 << 4;
    }
}

/// How a component type is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// The entity column.
    Entity,
    /// Plain per-entity data stored in the chunk.
    Data,
    /// Dynamic buffer; elements live inline up to `inline_capacity`, then
    /// spill to a heap allocation.
    Buffer { inline_capacity: u32 },
    /// Plain-data value shared by every entity of a chunk.
    Shared,
    /// Per-entity object stored in the managed store; the chunk holds an index.
    Managed,
    /// Object value shared by every entity of a chunk.
    SharedManaged,
}

impl ComponentKind {
    /// Stable numeric tag, used in persisted type tables.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::Entity => 0,
            Self::Data => 1,
            Self::Buffer { .. } => 2,
            Self::Shared => 3,
            Self::Managed => 4,
            Self::SharedManaged => 5,
        }
    }

    /// Whether values of this kind occupy space inside the chunk.
    #[must_use]
    pub const fn in_chunk(self) -> bool {
        matches!(
            self,
            Self::Entity | Self::Data | Self::Buffer { .. } | Self::Managed
        )
    }

    /// Whether this is a shared component kind.
    #[must_use]
    pub const fn is_shared(self) -> bool {
        matches!(self, Self::Shared | Self::SharedManaged)
    }
}

/// Byte offsets (within one element) of fields holding runtime-only values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldLayout {
    /// Offsets of [`Entity`] fields.
    pub entities: SmallVec<[u32; 4]>,
    /// Offsets of [`BlobAssetReference`](crate::BlobAssetReference) fields.
    pub blobs: SmallVec<[u32; 2]>,
    /// Offsets of [`WeakAssetRef`](crate::WeakAssetRef) fields.
    pub weak_assets: SmallVec<[u32; 2]>,
}

impl FieldLayout {
    /// Whether the layout has any field that needs relocation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.blobs.is_empty() && self.weak_assets.is_empty()
    }
}

/// Reads a boxed managed value from an object stream.
pub type ManagedReadFn = fn(&mut ObjectReader<'_>) -> Result<Box<dyn ManagedObject>, ObjectError>;

fn read_managed<T: ManagedComponent>(
    reader: &mut ObjectReader<'_>,
) -> Result<Box<dyn ManagedObject>, ObjectError> {
    Ok(Box::new(T::read(reader)?))
}

/// Describes a component type to the registry.
#[derive(Clone)]
pub struct TypeDescriptor {
    name: &'static str,
    hash: StableTypeHash,
    kind: ComponentKind,
    size: u32,
    flags: TypeFlags,
    fields: FieldLayout,
    managed_read: Option<ManagedReadFn>,
}

impl TypeDescriptor {
    /// Describe a type by name, kind and element size.
    #[must_use]
    pub fn new(name: &'static str, kind: ComponentKind, size: u32) -> Self {
        Self {
            name,
            hash: StableTypeHash::of_name(name),
            kind,
            size,
            flags: TypeFlags::empty(),
            fields: FieldLayout::default(),
            managed_read: None,
        }
    }

    /// Describe a plain-data component type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        T::describe(Self::new(T::NAME, T::KIND, mem::size_of::<T>() as u32))
    }

    /// Describe a managed component type.
    #[must_use]
    pub fn of_managed<T: ManagedComponent>() -> Self {
        let kind = if T::SHARED {
            ComponentKind::SharedManaged
        } else {
            ComponentKind::Managed
        };
        let mut descriptor = Self::new(T::NAME, kind, 0);
        if T::ALLOW_ENTITY_SERIALIZATION {
            descriptor.flags |= TypeFlags::ALLOW_ENTITY_SERIALIZATION;
        }
        descriptor.managed_read = Some(read_managed::<T>);
        descriptor
    }

    /// Override the stable hash (for types renamed after data was written).
    #[must_use]
    pub fn with_hash(mut self, hash: StableTypeHash) -> Self {
        self.hash = hash;
        self
    }

    /// Add flags.
    #[must_use]
    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Mark as enableable.
    #[must_use]
    pub fn enableable(self) -> Self {
        self.with_flags(TypeFlags::ENABLEABLE)
    }

    /// Mark as transient (never persisted).
    #[must_use]
    pub fn transient(self) -> Self {
        self.with_flags(TypeFlags::TRANSIENT)
    }

    /// Declare an [`Entity`] field at `offset`.
    #[must_use]
    pub fn entity_field(mut self, offset: usize) -> Self {
        self.fields.entities.push(offset as u32);
        self
    }

    /// Declare a blob asset reference field at `offset`.
    #[must_use]
    pub fn blob_field(mut self, offset: usize) -> Self {
        self.fields.blobs.push(offset as u32);
        self
    }

    /// Declare a weak asset reference field at `offset`.
    #[must_use]
    pub fn weak_asset_field(mut self, offset: usize) -> Self {
        self.fields.weak_assets.push(offset as u32);
        self
    }
}

/// Marker trait for plain-data component types.
///
/// `NAME` feeds the stable hash and must not change once data has been
/// written. For buffers, `Self` is the element type and `KIND` carries the
/// inline capacity.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Copy, Pod, Zeroable)]
/// #[repr(C)]
/// struct Target { entity: Entity }
///
/// impl Component for Target {
///     const NAME: &'static str = "game::Target";
///     fn describe(d: TypeDescriptor) -> TypeDescriptor {
///         d.entity_field(std::mem::offset_of!(Target, entity))
///     }
/// }
/// ```
pub trait Component: Pod + Send + Sync + 'static {
    /// Registered name.
    const NAME: &'static str;
    /// Storage kind.
    const KIND: ComponentKind = ComponentKind::Data;

    /// Add fields and flags to the default descriptor.
    fn describe(descriptor: TypeDescriptor) -> TypeDescriptor {
        descriptor
    }
}

/// Runtime information about a registered component type.
#[derive(Clone)]
pub struct ComponentInfo {
    id: ComponentId,
    descriptor: TypeDescriptor,
}

impl ComponentInfo {
    /// Get the component ID.
    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    /// Get the registered type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Get the stable hash.
    #[must_use]
    pub const fn stable_hash(&self) -> StableTypeHash {
        self.descriptor.hash
    }

    /// Get the storage kind.
    #[must_use]
    pub const fn kind(&self) -> ComponentKind {
        self.descriptor.kind
    }

    /// Size of one element (component value or buffer element).
    #[must_use]
    pub const fn size(&self) -> usize {
        self.descriptor.size as usize
    }

    /// Get the type flags.
    #[must_use]
    pub const fn flags(&self) -> TypeFlags {
        self.descriptor.flags
    }

    /// Get the relocatable field layout of one element.
    #[must_use]
    pub const fn fields(&self) -> &FieldLayout {
        &self.descriptor.fields
    }

    /// Decoder for managed values, if this is a managed type.
    #[must_use]
    pub const fn managed_read(&self) -> Option<ManagedReadFn> {
        self.descriptor.managed_read
    }

    /// Whether this type carries enable bits.
    #[must_use]
    pub const fn is_enableable(&self) -> bool {
        self.descriptor.flags.contains(TypeFlags::ENABLEABLE)
    }

    /// Bytes one entity occupies in a chunk for this type.
    #[must_use]
    pub const fn chunk_stride(&self) -> usize {
        match self.descriptor.kind {
            ComponentKind::Entity => Entity::SIZE,
            ComponentKind::Data => self.descriptor.size as usize,
            ComponentKind::Buffer { inline_capacity } => {
                let inline = (inline_capacity * self.descriptor.size) as usize;
                BUFFER_HEADER_SIZE + (inline + 7) / 8 * 8
            }
            ComponentKind::Managed => mem::size_of::<u32>(),
            ComponentKind::Shared | ComponentKind::SharedManaged => 0,
        }
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("name", &self.descriptor.name)
            .field("hash", &self.descriptor.hash)
            .field("kind", &self.descriptor.kind)
            .field("size", &self.descriptor.size)
            .finish()
    }
}

/// Registry for component types.
///
/// Maps Rust types and stable hashes to `ComponentId`s. The built-in
/// [`Entity`] and [`ChunkLink`] types are always present.
pub struct ComponentRegistry {
    type_to_id: HashMap<TypeId, ComponentId>,
    hash_to_id: HashMap<StableTypeHash, ComponentId>,
    infos: Vec<ComponentInfo>,
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentRegistry {
    /// Create a registry holding only the built-in types.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            type_to_id: HashMap::new(),
            hash_to_id: HashMap::new(),
            infos: Vec::new(),
        };

        let entity = TypeDescriptor::new("Entity", ComponentKind::Entity, Entity::SIZE as u32);
        let link = TypeDescriptor::of::<ChunkLink>().with_flags(TypeFlags::CHUNK_LINK);
        registry.insert(entity, Some(TypeId::of::<Entity>()));
        registry.insert(link, Some(TypeId::of::<ChunkLink>()));
        debug_assert_eq!(registry.infos[0].id, ComponentId::ENTITY);
        debug_assert_eq!(registry.infos[1].id, ComponentId::CHUNK_LINK);

        registry
    }

    fn insert(&mut self, descriptor: TypeDescriptor, type_id: Option<TypeId>) -> ComponentId {
        let id = ComponentId(self.infos.len() as u32);
        self.hash_to_id.insert(descriptor.hash, id);
        if let Some(type_id) = type_id {
            self.type_to_id.insert(type_id, id);
        }
        self.infos.push(ComponentInfo { id, descriptor });
        id
    }

    /// Register a descriptor, optionally bound to a Rust type.
    ///
    /// Registering the same hash twice for the same Rust type returns the
    /// existing ID. A hash collision between different types is an error.
    pub fn register_descriptor(
        &mut self,
        descriptor: TypeDescriptor,
        type_id: Option<TypeId>,
    ) -> EcsResult<ComponentId> {
        if let Some(&existing) = self.hash_to_id.get(&descriptor.hash) {
            let same_type = type_id.is_some_and(|t| self.type_to_id.get(&t) == Some(&existing));
            if same_type
                || (type_id.is_none() && self.infos[existing.0 as usize].name() == descriptor.name)
            {
                return Ok(existing);
            }
            return Err(EcsError::DuplicateStableHash {
                hash: descriptor.hash,
                existing: self.infos[existing.0 as usize].name(),
                new: descriptor.name,
            });
        }

        if descriptor.kind == ComponentKind::Entity {
            return Err(EcsError::InvalidDescriptor {
                name: descriptor.name,
                reason: "the entity column is built in",
            });
        }
        let fields = &descriptor.fields;
        let spans = (fields.entities.iter().map(|&o| (o, Entity::SIZE)))
            .chain(fields.blobs.iter().map(|&o| (o, mem::size_of::<BlobAssetReference>())))
            .chain(fields.weak_assets.iter().map(|&o| (o, mem::size_of::<WeakAssetRef>())));
        for (offset, len) in spans {
            if offset as usize + len > descriptor.size as usize {
                return Err(EcsError::InvalidDescriptor {
                    name: descriptor.name,
                    reason: "relocatable field lies outside the element",
                });
            }
        }

        Ok(self.insert(descriptor, type_id))
    }

    /// Register a plain-data component type and return its ID.
    pub fn register<T: Component>(&mut self) -> EcsResult<ComponentId> {
        if let Some(&id) = self.type_to_id.get(&TypeId::of::<T>()) {
            return Ok(id);
        }
        self.register_descriptor(TypeDescriptor::of::<T>(), Some(TypeId::of::<T>()))
    }

    /// Register a managed component type and return its ID.
    pub fn register_managed<T: ManagedComponent>(&mut self) -> EcsResult<ComponentId> {
        if let Some(&id) = self.type_to_id.get(&TypeId::of::<T>()) {
            return Ok(id);
        }
        self.register_descriptor(TypeDescriptor::of_managed::<T>(), Some(TypeId::of::<T>()))
    }

    /// Get the component ID for a Rust type, if registered.
    #[must_use]
    pub fn get_id<T: 'static>(&self) -> Option<ComponentId> {
        self.type_to_id.get(&TypeId::of::<T>()).copied()
    }

    /// Resolve a stable hash to a component ID.
    #[must_use]
    pub fn get_by_hash(&self, hash: StableTypeHash) -> Option<ComponentId> {
        self.hash_to_id.get(&hash).copied()
    }

    /// Get component info by ID.
    #[must_use]
    pub fn get_info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.infos.get(id.0 as usize)
    }

    /// Get component info by ID, or an error naming the ID.
    pub fn info(&self, id: ComponentId) -> EcsResult<&ComponentInfo> {
        self.get_info(id).ok_or(EcsError::UnknownComponent(id))
    }

    /// Get the number of registered types, built-ins included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Always false: built-ins are registered on creation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Iterate over all registered component infos.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("count", &self.len())
            .field("components", &self.infos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        const NAME: &'static str = "tests::Position";
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Target {
        weight: f32,
        pad: u32,
        entity: Entity,
    }

    impl Component for Target {
        const NAME: &'static str = "tests::Target";
        fn describe(d: TypeDescriptor) -> TypeDescriptor {
            d.entity_field(mem::offset_of!(Target, entity)).enableable()
        }
    }

    #[derive(Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Waypoint(u32);

    impl Component for Waypoint {
        const NAME: &'static str = "tests::Waypoint";
        const KIND: ComponentKind = ComponentKind::Buffer { inline_capacity: 3 };
    }

    #[test]
    fn test_component_registration() {
        let mut registry = ComponentRegistry::new();

        let pos_id = registry.register::<Position>().unwrap();
        let target_id = registry.register::<Target>().unwrap();

        assert_ne!(pos_id, target_id);
        assert_eq!(registry.get_id::<Position>(), Some(pos_id));
        assert_eq!(
            registry.get_by_hash(StableTypeHash::of_name("tests::Target")),
            Some(target_id)
        );
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_idempotent_registration() {
        let mut registry = ComponentRegistry::new();
        let id1 = registry.register::<Position>().unwrap();
        let id2 = registry.register::<Position>().unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_descriptor_fields() {
        let mut registry = ComponentRegistry::new();
        let id = registry.register::<Target>().unwrap();
        let info = registry.get_info(id).unwrap();

        assert_eq!(info.fields().entities.as_slice(), &[8]);
        assert!(info.is_enableable());
        assert_eq!(info.chunk_stride(), 16);
    }

    #[test]
    fn test_buffer_stride() {
        let mut registry = ComponentRegistry::new();
        let id = registry.register::<Waypoint>().unwrap();
        let info = registry.get_info(id).unwrap();
        // header + 3 * 4 bytes rounded up to 8
        assert_eq!(info.chunk_stride(), BUFFER_HEADER_SIZE + 16);
    }

    #[test]
    fn test_hash_collision_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.register::<Position>().unwrap();
        let clash = TypeDescriptor::new("other", ComponentKind::Data, 4)
            .with_hash(StableTypeHash::of_name("tests::Position"));
        assert!(matches!(
            registry.register_descriptor(clash, None),
            Err(EcsError::DuplicateStableHash { .. })
        ));
    }

    #[test]
    fn test_field_outside_element_rejected() {
        let mut registry = ComponentRegistry::new();
        let bad = TypeDescriptor::new("bad", ComponentKind::Data, 4).entity_field(0);
        assert!(registry.register_descriptor(bad, None).is_err());
    }

    #[test]
    fn test_stable_hash_is_fnv1a() {
        assert_eq!(StableTypeHash::of_name("").0, 0xcbf2_9ce4_8422_2325);
        assert_eq!(StableTypeHash::of_name("a").0, 0xaf63_dc4c_8601_ec8c);
    }
}
