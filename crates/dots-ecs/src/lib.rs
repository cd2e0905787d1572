#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::manual_let_else)]

//! DOTS ECS - chunked entity store with relocatable component memory.
//!
//! Entities of one archetype live in fixed 16 KiB chunks laid out as
//! structure-of-arrays. Chunk memory is plain bytes: anything in it that is
//! only meaningful at runtime (entities, blob references, buffer heap handles,
//! managed indices) is described by the type registry, so a persistence layer
//! can copy chunks verbatim and relocate those fields on the way in and out.
//!
//! # Key Concepts
//!
//! - **Entity**: versioned index; the all-zero value is null
//! - **Component**: `Pod` value in a chunk column, described by a [`TypeDescriptor`]
//! - **Archetype**: canonical set of member types sharing one chunk layout
//! - **Dynamic buffer**: inline storage that spills to the [`BufferHeap`]
//! - **Shared component**: one value per chunk, refcounted in the [`SharedComponentStore`]
//! - **Managed component**: boxed Rust value, the chunk holds an index
//! - **Chunk component**: one value per chunk, stored on the chunk's meta entity
//! - **Blob asset**: immutable bytes addressed through the [`BlobStore`]
//!
//! # Example
//!
//! ```ignore
//! let mut world = World::new();
//! let health = world.register::<Health>()?;
//! let archetype = world.archetype(&[health])?;
//! let entity = world.spawn(archetype)?;
//! world.set(entity, Health(10));
//! assert_eq!(world.get::<Health>(entity), Some(Health(10)));
//! ```

mod archetype;
mod blob;
mod buffer;
mod chunk;
mod component;
mod entity;
mod error;
mod managed;
mod object;
mod shared;
mod world;

pub use archetype::{Archetype, ArchetypeColumn, ArchetypeId, ArchetypeType};
pub use blob::{
    BLOB_HEADER_SIZE, BlobAssetReference, BlobBatchId, BlobHeader, BlobStore, blob_record_len,
    encode_blob_record,
};
pub use buffer::BufferHeap;
pub use chunk::{
    BUFFER_HEADER_SIZE, BufferHeader, CHUNK_HEADER_SIZE, CHUNK_SIZE, Chunk, ChunkBlock,
    ChunkHeader, ChunkLink, ChunkSlot, ColumnLayout, MAX_CHUNKS_PER_BLOCK, MAX_ENTITIES_PER_CHUNK,
    count_disabled,
};
pub use component::{
    Component, ComponentId, ComponentInfo, ComponentKind, ComponentRegistry, FieldLayout,
    ManagedReadFn, StableTypeHash, TypeDescriptor, TypeFlags, fnv1a64,
};
pub use entity::{Entity, EntityId, EntityLocation};
pub use error::{EcsError, EcsResult};
pub use managed::{ManagedComponent, ManagedObject, ManagedStore};
pub use object::{
    ObjectError, ObjectReader, ObjectResult, ObjectWriter, Persist, ReadRelocator, WeakAssetRef,
    WriteRelocator,
};
pub use shared::{SharedComponentStore, SharedEntry, SharedValue};
pub use world::{ChunkInstall, World};
