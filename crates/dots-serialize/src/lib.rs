#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::manual_let_else)]

//! DOTS Serialization - binary container and world capture/restore.
//!
//! A world is persisted by copying its chunks verbatim and relocating the
//! few fields inside them that only mean something at runtime. Everything
//! lands in a self-describing node tree that can be navigated without
//! reading node payloads.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  world                                                              │
//! │    - serialize_world / deserialize_world                            │
//! │    - dense entity remap, blob and weak asset relocation             │
//! │    - shared/managed values, enable bits, spilled buffers            │
//! └─────────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  format                                                             │
//! │    - ContainerWriter: nested nodes, per-node metadata               │
//! │    - ContainerReader: header + node table, data read on demand      │
//! │    - StringTable: deduplicated UTF-8 strings                        │
//! └─────────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  stream / batch                                                     │
//! │    - BinaryWriter / BinaryReader over memory or files               │
//! │    - AsyncFileReader: batched reads on a background thread          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use dots_serialize::{DeserializeOptions, MemoryBinaryReader, MemoryBinaryWriter, SerializeOptions};
//!
//! let (out, referenced) =
//!     dots_serialize::serialize_world(&world, MemoryBinaryWriter::new(), &SerializeOptions::default())?;
//!
//! let mut restored = World::new();
//! restored.register::<Health>()?;
//! let reader = MemoryBinaryReader::new(out.as_slice());
//! let load = dots_serialize::deserialize_world(&mut restored, reader, &referenced, &DeserializeOptions::default())?;
//! assert_eq!(load.entities, world.entity_count());
//! ```

mod batch;
mod error;
pub mod format;
mod paged;
mod stream;
mod world;

pub use batch::{AsyncFileReader, ReadCommand, ReadHandle};
pub use error::{NotSerializableReason, SerializationError, SerializationResult};
pub use format::{
    ContainerConfig, ContainerReader, ContainerWriter, NodeRef, NodeType, StringTable,
    StringTableWriter,
};
pub use paged::{DEFAULT_PAGE_SIZE, PagedAllocation, Reservation};
pub use stream::{
    BinaryReader, BinaryReaderExt, BinaryWriter, BinaryWriterExt, MemoryBinaryReader,
    MemoryBinaryWriter, STREAM_BUFFER_SIZE, StreamBinaryReader, StreamBinaryWriter,
};
pub use world::{
    CHUNK_COMPONENT_FLAG, DeserializeOptions, NULL_BLOB_OFFSET, SECTION_REVISION,
    SerializeOptions, WORLD_FILE_TYPE, WorldLoad, deserialize_world, read_world_node,
    serialize_world, write_world_node,
};
