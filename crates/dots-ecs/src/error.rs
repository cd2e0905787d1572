//! Error types for the entity store.

use thiserror::Error;

use crate::{ArchetypeId, ComponentId, Entity, StableTypeHash};

#[derive(Error, Debug)]
pub enum EcsError {
    #[error("component {0:?} is not registered")]
    UnknownComponent(ComponentId),

    #[error("type {0} is not registered")]
    NotRegistered(&'static str),

    #[error("stable hash {hash} of {new} collides with {existing}")]
    DuplicateStableHash {
        hash: StableTypeHash,
        existing: &'static str,
        new: &'static str,
    },

    #[error("invalid descriptor for {name}: {reason}")]
    InvalidDescriptor {
        name: &'static str,
        reason: &'static str,
    },

    #[error("invalid archetype: {0}")]
    InvalidArchetype(&'static str),

    #[error("archetype {0:?} does not exist")]
    UnknownArchetype(ArchetypeId),

    #[error("a row of {row_size} bytes does not fit in a chunk")]
    ArchetypeTooLarge { row_size: usize },

    #[error("chunk block of {len} bytes is not a whole number of chunks")]
    InvalidChunkBlock { len: usize },

    #[error("entity {0:?} is not alive")]
    NoSuchEntity(Entity),

    #[error("{name} is not a {expected} component")]
    WrongKind {
        name: &'static str,
        expected: &'static str,
    },

    #[error("{name} value is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("world already holds {entities} entities")]
    NotEmpty { entities: u32 },

    #[error("cannot install chunk: {0}")]
    InvalidChunk(String),
}

pub type EcsResult<T> = Result<T, EcsError>;
