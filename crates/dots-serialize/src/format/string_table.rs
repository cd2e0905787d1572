//! Deduplicated string tables.
//!
//! A table node's data is a run of `{i32 length, UTF-8 bytes}` records and its
//! count field holds the number of records. Strings are addressed by the byte
//! offset of their record.

use rustc_hash::FxHashMap;
use uuid::Uuid;

use super::{
    NodeType,
    reader::{ContainerReader, NodeRef},
    truncate_utf8,
    writer::{ContainerWriter, NodeHandle},
};
use crate::{SerializationError, SerializationResult, stream::{BinaryReader, BinaryWriter}};

/// Returned for an offset that does not start a record.
pub const INVALID_OFFSET: &str = "<invalid string offset>";

/// Returned for a record that is not valid UTF-8.
pub const INVALID_UTF8: &str = "<invalid utf-8>";

/// Builds a string table node.
///
/// The node is deferred, so strings can be added while sibling or child
/// nodes are being written.
pub struct StringTableWriter {
    node: NodeHandle,
    offsets: FxHashMap<String, i32>,
    len: usize,
    count: i32,
}

impl StringTableWriter {
    /// Open a table node as a child of the current node.
    pub fn begin<W: BinaryWriter>(
        writer: &mut ContainerWriter<W>,
        node_type: NodeType,
        id: Uuid,
    ) -> SerializationResult<Self> {
        let node = writer.create_deferred_node(node_type, id)?;
        Ok(Self {
            node,
            offsets: FxHashMap::default(),
            len: 0,
            count: 0,
        })
    }

    /// Add a string, returning the offset of its record.
    ///
    /// Adding a string twice returns the first offset.
    pub fn add<W: BinaryWriter>(&mut self, writer: &mut ContainerWriter<W>, value: &str) -> SerializationResult<i32> {
        if let Some(&offset) = self.offsets.get(value) {
            return Ok(offset);
        }
        let offset = self.len as i32;
        let mut record = Vec::with_capacity(4 + value.len());
        record.extend_from_slice(&(value.len() as i32).to_le_bytes());
        record.extend_from_slice(value.as_bytes());
        writer.write_deferred(self.node, &record)?;

        self.len += record.len();
        self.count += 1;
        writer.set_extension_of(self.node, self.count)?;
        self.offsets.insert(value.to_owned(), offset);
        Ok(offset)
    }

    #[must_use]
    pub const fn count(&self) -> i32 {
        self.count
    }

    /// Close the table node. It must be the innermost open node.
    pub fn finish<W: BinaryWriter>(self, writer: &mut ContainerWriter<W>) -> SerializationResult<()> {
        if writer.current_node() != Some(self.node) {
            return Err(SerializationError::NodeNotOpen);
        }
        writer.end_node()
    }
}

/// Fixed string capacities, as `N`-byte buffers holding a two-byte length
/// and a terminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixedCapacity {
    Bytes32,
    Bytes64,
    Bytes128,
    Bytes512,
}

impl FixedCapacity {
    /// Bytes of UTF-8 a string of this capacity holds.
    #[must_use]
    pub const fn capacity(self) -> usize {
        let total = match self {
            Self::Bytes32 => 32,
            Self::Bytes64 => 64,
            Self::Bytes128 => 128,
            Self::Bytes512 => 512,
        };
        total - 3
    }
}

/// A loaded string table.
#[derive(Clone, Debug, Default)]
pub struct StringTable {
    data: Vec<u8>,
    count: i32,
}

impl StringTable {
    pub fn load<R: BinaryReader>(reader: &mut ContainerReader<R>, node: NodeRef) -> SerializationResult<Self> {
        let count = reader.extension(node)?;
        let data = reader.read_data_to_vec(node)?;
        Ok(Self::from_bytes(data, count))
    }

    #[must_use]
    pub const fn from_bytes(data: Vec<u8>, count: i32) -> Self {
        Self { data, count }
    }

    fn record(&self, offset: i32) -> Result<&[u8], &'static str> {
        let start = usize::try_from(offset).map_err(|_| INVALID_OFFSET)?;
        let len_bytes: [u8; 4] = self
            .data
            .get(start..start + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(INVALID_OFFSET)?;
        let len = usize::try_from(i32::from_le_bytes(len_bytes)).map_err(|_| INVALID_OFFSET)?;
        self.data.get(start + 4..start + 4 + len).ok_or(INVALID_OFFSET)
    }

    /// The string at `offset`, or a placeholder if the offset or bytes are
    /// invalid.
    #[must_use]
    pub fn get(&self, offset: i32) -> &str {
        match self.record(offset) {
            Ok(bytes) => std::str::from_utf8(bytes).unwrap_or(INVALID_UTF8),
            Err(placeholder) => placeholder,
        }
    }

    /// The string at `offset`, cut to at most `max_bytes` on a char boundary.
    #[must_use]
    pub fn get_truncated(&self, offset: i32, max_bytes: usize) -> &str {
        truncate_utf8(self.get(offset), max_bytes)
    }

    #[must_use]
    pub fn get_fixed(&self, offset: i32, capacity: FixedCapacity) -> &str {
        self.get_truncated(offset, capacity.capacity())
    }

    /// Offsets and strings in record order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> + '_ {
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            if offset >= self.data.len() {
                return None;
            }
            let current = offset as i32;
            let record = self.record(current).ok()?;
            offset += 4 + record.len();
            Some((current, self.get(current)))
        })
    }

    /// Record count stored in the node header.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.count).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
