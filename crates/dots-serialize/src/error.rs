//! Serialization error types.

use std::fmt;

use dots_ecs::{EcsError, ObjectError, StableTypeHash};
use thiserror::Error;

/// Why a component type cannot be written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotSerializableReason {
    /// Shared component holding entity references without opting in.
    SharedWithEntityReferences,
    /// Blittable type with a raw pointer field.
    NativePointer,
    /// Runtime bookkeeping type mixed into a persisted archetype.
    Transient,
}

impl fmt::Display for NotSerializableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedWithEntityReferences => f.write_str(
                "shared components with entity references must opt in to entity serialization",
            ),
            Self::NativePointer => f.write_str("types with native pointer fields cannot be serialized"),
            Self::Transient => f.write_str("transient types are never serialized"),
        }
    }
}

/// Serialization error type.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The entity store rejected an operation.
    #[error("entity store error: {0}")]
    Ecs(#[from] EcsError),

    /// A managed value failed to encode or decode.
    #[error("object graph error: {0}")]
    Object(#[from] ObjectError),

    /// Magic bytes do not match.
    #[error("not a DOTS serialization container")]
    NotAContainer,

    /// The file was written with another format version.
    #[error("file format version {found} does not match current version {expected}")]
    VersionMismatch { found: i32, expected: i32 },

    /// A section was written with a layout revision this reader does not know.
    #[error("section {section} has revision {found}, expected {expected}")]
    RevisionMismatch {
        section: &'static str,
        found: i32,
        expected: i32,
    },

    /// A section required to load the world is missing.
    #[error("required section {0} is missing")]
    MissingSection(&'static str),

    /// A fixed-size payload has the wrong size.
    #[error("{what} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// A type hash names a type this process has not registered.
    #[error("type {name} ({hash}) is not registered in this world")]
    TypeNotFound { name: String, hash: StableTypeHash },

    /// A type hash is unknown and the file carries no debug type names.
    #[error(
        "type hash {0} is not registered in this world; the writer logs every type hash at debug level, check that log for the type name"
    )]
    UnknownTypeHash(StableTypeHash),

    /// A type in a persisted archetype cannot be written.
    #[error("{name} cannot be serialized: {reason}")]
    NotSerializable {
        name: &'static str,
        reason: NotSerializableReason,
    },

    /// A chunk refers to a shared component the file does not contain.
    #[error(
        "archetype references shared component {index} but only {available} are available; the data may come from a partially loaded shared scene"
    )]
    SharedComponentOutOfRange { index: u32, available: u32 },

    /// Deserialization target already holds entities.
    #[error("destination world already holds {0} entities")]
    DestinationNotEmpty(u32),

    /// Data written to a node after its children were created.
    #[error("cannot write data to a node after creating its children")]
    InterleavedWrite,

    /// Node operation with no node open.
    #[error("no node is open")]
    NodeNotOpen,

    /// Finish attempted while nodes are still open.
    #[error("{0} nodes are still open")]
    UnbalancedNode(usize),

    /// Output taken before the header was written.
    #[error("container writer has not been finished")]
    WriterNotFinished,

    /// Node or data written after the header was written.
    #[error("container writer has already been finished")]
    WriterFinished,

    /// Structurally invalid content.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// A weak asset index has no entry in the referenced objects.
    #[error("weak asset index {index} out of range ({len} referenced objects)")]
    WeakAssetOutOfRange { index: u64, len: usize },
}

/// Result type for serialization operations.
pub type SerializationResult<T> = Result<T, SerializationError>;
