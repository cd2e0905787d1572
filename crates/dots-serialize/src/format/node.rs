//! Node headers and the closed set of node types.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dots_ecs::fnv1a64;
use uuid::Uuid;

use crate::{SerializationError, SerializationResult};

/// Encoded size of the fields every node header starts with.
pub const NODE_HEADER_SIZE: usize = 68;

/// Location of a metadata or data segment, relative to its section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub offset: i64,
    pub size: i64,
}

impl Segment {
    /// Offset −1 marks an absent segment.
    pub const ABSENT: Self = Self { offset: -1, size: 0 };

    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.offset >= 0
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.offset + self.size
    }
}

/// Header fields a node type appends to the common header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLayout {
    /// Nothing appended.
    Plain,
    /// An `i32` layout revision of the raw data.
    Revisioned,
    /// An `i32` count of records in the raw data.
    Counted,
}

impl NodeLayout {
    #[must_use]
    pub const fn header_size(self) -> usize {
        match self {
            Self::Plain => NODE_HEADER_SIZE,
            Self::Revisioned | Self::Counted => NODE_HEADER_SIZE + 4,
        }
    }
}

/// Every node type this crate writes.
///
/// A node type is identified on disk by the FNV-1a hash of its name. Readers
/// tolerate hashes outside this set: such nodes can be navigated and their
/// data read, they are just never interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Generic grouping node.
    Folder,
    /// Generic revisioned payload.
    RawData,
    /// Generic string table.
    StringTable,
    World,
    DebugFolder,
    TypeNames,
    TypeNameMap,
    Archetypes,
    BlobAssets,
    SharedAndManagedComponents,
    EnabledBits,
    Chunks,
    BufferData,
    Prefab,
}

impl NodeType {
    pub const ALL: [Self; 14] = [
        Self::Folder,
        Self::RawData,
        Self::StringTable,
        Self::World,
        Self::DebugFolder,
        Self::TypeNames,
        Self::TypeNameMap,
        Self::Archetypes,
        Self::BlobAssets,
        Self::SharedAndManagedComponents,
        Self::EnabledBits,
        Self::Chunks,
        Self::BufferData,
        Self::Prefab,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Folder => "dots::Folder",
            Self::RawData => "dots::RawData",
            Self::StringTable => "dots::StringTable",
            Self::World => "dots::World",
            Self::DebugFolder => "dots::World::Debug",
            Self::TypeNames => "dots::World::TypeNames",
            Self::TypeNameMap => "dots::World::TypeNameMap",
            Self::Archetypes => "dots::World::Archetypes",
            Self::BlobAssets => "dots::World::BlobAssets",
            Self::SharedAndManagedComponents => "dots::World::SharedAndManagedComponents",
            Self::EnabledBits => "dots::World::EnabledBits",
            Self::Chunks => "dots::World::Chunks",
            Self::BufferData => "dots::World::BufferData",
            Self::Prefab => "dots::World::Prefab",
        }
    }

    /// Hash stored in the node header.
    #[must_use]
    pub const fn type_hash(self) -> u64 {
        fnv1a64(self.name().as_bytes())
    }

    #[must_use]
    pub const fn layout(self) -> NodeLayout {
        match self {
            Self::Folder | Self::World | Self::DebugFolder => NodeLayout::Plain,
            Self::StringTable | Self::TypeNames => NodeLayout::Counted,
            Self::RawData
            | Self::TypeNameMap
            | Self::Archetypes
            | Self::BlobAssets
            | Self::SharedAndManagedComponents
            | Self::EnabledBits
            | Self::Chunks
            | Self::BufferData
            | Self::Prefab => NodeLayout::Revisioned,
        }
    }

    #[must_use]
    pub fn from_hash(hash: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.type_hash() == hash)
    }
}

/// On-disk node header.
///
/// `next_sibling_offset` is the byte offset of the next sibling's header
/// within the node section, or −1 for the last child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub type_hash: u64,
    pub id: Uuid,
    pub header_size: i32,
    pub next_sibling_offset: i32,
    pub child_count: i32,
    pub metadata: Segment,
    pub data: Segment,
    /// Revision or record count, for layouts that carry one.
    pub extension: i32,
}

impl NodeHeader {
    #[must_use]
    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_hash(self.type_hash)
    }

    fn extended(&self) -> bool {
        self.header_size as usize >= NodeLayout::Revisioned.header_size()
            && self
                .node_type()
                .is_some_and(|ty| ty.layout() != NodeLayout::Plain)
    }

    /// Encode into `out`, which must be exactly `header_size` bytes.
    pub fn encode(&self, mut out: &mut [u8]) -> SerializationResult<()> {
        let extended = self.extended();
        out.write_u64::<LittleEndian>(self.type_hash)?;
        out.write_all(self.id.as_bytes())?;
        out.write_i32::<LittleEndian>(self.header_size)?;
        out.write_i32::<LittleEndian>(self.next_sibling_offset)?;
        out.write_i32::<LittleEndian>(self.child_count)?;
        out.write_i64::<LittleEndian>(self.metadata.offset)?;
        out.write_i64::<LittleEndian>(self.metadata.size)?;
        out.write_i64::<LittleEndian>(self.data.offset)?;
        out.write_i64::<LittleEndian>(self.data.size)?;
        if extended {
            out.write_i32::<LittleEndian>(self.extension)?;
        }
        Ok(())
    }

    /// Decode a header from the start of `bytes`.
    ///
    /// Fields past the known layout of the node's type are skipped.
    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE {
            return Err(SerializationError::Corrupt(format!(
                "node header truncated to {} bytes",
                bytes.len()
            )));
        }
        let mut input = bytes;
        let type_hash = input.read_u64::<LittleEndian>()?;
        let mut id = [0u8; 16];
        input.read_exact(&mut id)?;

        let mut header = Self {
            type_hash,
            id: Uuid::from_bytes(id),
            header_size: input.read_i32::<LittleEndian>()?,
            next_sibling_offset: input.read_i32::<LittleEndian>()?,
            child_count: input.read_i32::<LittleEndian>()?,
            metadata: Segment {
                offset: input.read_i64::<LittleEndian>()?,
                size: input.read_i64::<LittleEndian>()?,
            },
            data: Segment {
                offset: input.read_i64::<LittleEndian>()?,
                size: input.read_i64::<LittleEndian>()?,
            },
            extension: 0,
        };
        if header.header_size < NODE_HEADER_SIZE as i32 || header.header_size as usize > bytes.len() {
            return Err(SerializationError::Corrupt(format!(
                "node header size {} out of range",
                header.header_size
            )));
        }
        if header.extended() {
            header.extension = input.read_i32::<LittleEndian>()?;
        }
        Ok(header)
    }
}
