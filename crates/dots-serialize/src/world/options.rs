//! Options for writing and reading worlds.

use dots_ecs::{Entity, MAX_CHUNKS_PER_BLOCK};
use uuid::Uuid;

/// Options for [`serialize_world`](crate::serialize_world).
#[derive(Clone, Debug, Default)]
pub struct SerializeOptions {
    /// Write a table of type names so an unknown type hash can be reported
    /// by name when the file is read.
    pub debug_type_names: bool,
    /// Entity to mark as the root of a prefab.
    pub prefab_root: Option<Entity>,
    /// Id of the container; nil when unset.
    pub file_id: Option<Uuid>,
}

impl SerializeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_debug_type_names(mut self, enabled: bool) -> Self {
        self.debug_type_names = enabled;
        self
    }

    #[must_use]
    pub const fn with_prefab_root(mut self, root: Entity) -> Self {
        self.prefab_root = Some(root);
        self
    }

    #[must_use]
    pub const fn with_file_id(mut self, id: Uuid) -> Self {
        self.file_id = Some(id);
        self
    }
}

/// Options for [`deserialize_world`](crate::deserialize_world).
#[derive(Clone, Debug)]
pub struct DeserializeOptions {
    /// Upper bound on chunks requested per contiguous block allocation.
    pub max_chunks_per_block: usize,
}

impl Default for DeserializeOptions {
    fn default() -> Self {
        Self {
            max_chunks_per_block: MAX_CHUNKS_PER_BLOCK,
        }
    }
}

impl DeserializeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped to at least one chunk.
    #[must_use]
    pub fn with_max_chunks_per_block(mut self, chunks: usize) -> Self {
        self.max_chunks_per_block = chunks.max(1);
        self
    }
}
