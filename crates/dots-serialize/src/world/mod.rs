//! World capture and restore.
//!
//! A world is written as one `World` node:
//!
//! ```text
//! World                         metadata: entity/archetype/chunk/type counts
//! ├── DebugFolder               optional
//! │   ├── TypeNames             string table of component names
//! │   └── TypeNameMap           {type hash, name offset}
//! ├── Archetypes                type table, archetype table
//! ├── SharedAndManagedComponents
//! ├── EnabledBits
//! ├── Chunks                    raw 16 KiB chunks, archetype by archetype
//! ├── BufferData                spilled dynamic buffer contents
//! ├── BlobAssets                optional, one batch of blob records
//! └── Prefab                    optional, root entity
//! ```
//!
//! Entities in the file are dense: the n-th written entity is `(n, 1)`, so a
//! restored world reproduces the same indices.

mod capture;
mod options;
mod relocate;
mod restore;
mod sections;

use dots_ecs::{WeakAssetRef, World};
pub use options::{DeserializeOptions, SerializeOptions};
pub use relocate::NULL_BLOB_OFFSET;
pub use restore::WorldLoad;
pub use sections::{CHUNK_COMPONENT_FLAG, SECTION_REVISION};

use crate::{
    SerializationError, SerializationResult,
    format::{ContainerConfig, ContainerReader, ContainerWriter, NodeRef, NodeType},
    stream::{BinaryReader, BinaryWriter},
};

/// File type recorded in containers written by [`serialize_world`].
pub const WORLD_FILE_TYPE: &str = "dots::World";

/// Write `world` as a `World` node below the writer's current node.
///
/// Returns the weak asset references found in the world. The file stores
/// 1-based indices into this list; pass the same list to [`read_world_node`].
pub fn write_world_node<W: BinaryWriter>(
    world: &World,
    writer: &mut ContainerWriter<W>,
    options: &SerializeOptions,
) -> SerializationResult<Vec<WeakAssetRef>> {
    capture::capture_world(world, writer, options)
}

/// Write `world` into a new container on `stream`.
pub fn serialize_world<W: BinaryWriter>(
    world: &World,
    stream: W,
    options: &SerializeOptions,
) -> SerializationResult<(W, Vec<WeakAssetRef>)> {
    let mut config = ContainerConfig::new(WORLD_FILE_TYPE);
    if let Some(id) = options.file_id {
        config = config.with_file_id(id);
    }
    let mut writer = ContainerWriter::new(stream, config)?;
    let referenced = write_world_node(world, &mut writer, options)?;
    Ok((writer.finish()?, referenced))
}

/// Read the `World` node `node` into `world`, which must hold no entities.
///
/// On error the world may hold partially restored state and should be
/// dropped.
pub fn read_world_node<R: BinaryReader>(
    world: &mut World,
    reader: &mut ContainerReader<R>,
    node: NodeRef,
    referenced: &[WeakAssetRef],
    options: &DeserializeOptions,
) -> SerializationResult<WorldLoad> {
    if reader.node_type(node)? != Some(NodeType::World) {
        return Err(SerializationError::MissingSection(NodeType::World.name()));
    }
    restore::restore_world(world, reader, node, referenced, options)
}

/// Read the first-level `World` node of the container on `stream`.
pub fn deserialize_world<R: BinaryReader>(
    world: &mut World,
    stream: R,
    referenced: &[WeakAssetRef],
    options: &DeserializeOptions,
) -> SerializationResult<WorldLoad> {
    let mut reader = ContainerReader::open(stream)?;
    let node = reader
        .find_node_by_type(NodeRef::ROOT, NodeType::World, 1)
        .ok_or(SerializationError::MissingSection(NodeType::World.name()))?;
    read_world_node(world, &mut reader, node, referenced, options)
}
