//! Container reader.

use dots_ecs::{BLOB_HEADER_SIZE, BlobHeader, fnv1a64};
use tracing::debug;
use uuid::Uuid;

use super::{
    header::{FILE_HEADER_SIZE, FileHeader},
    node::{NODE_HEADER_SIZE, NodeHeader, NodeType, Segment},
};
use crate::{SerializationError, SerializationResult, batch::ReadCommand, stream::BinaryReader};

/// Deepest node nesting a reader accepts.
pub const MAX_NODE_DEPTH: usize = 256;

/// Reference to a node of an open container.
///
/// [`NodeRef::ROOT`] is the implicit parent of the first-level nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRef(u32);

impl NodeRef {
    pub const ROOT: Self = Self(0);

    const fn index(self) -> Option<usize> {
        match self.0 {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    const fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }
}

/// Summary of a node header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// `None` for node types this crate does not know.
    pub node_type: Option<NodeType>,
    pub type_hash: u64,
    pub id: Uuid,
    pub child_count: i32,
    pub data_len: u64,
    pub has_metadata: bool,
    pub extension: i32,
}

/// Random-access reader over a container.
///
/// Opening reads the header, metadata and node sections; node data stays in
/// the stream until asked for.
pub struct ContainerReader<R: BinaryReader> {
    stream: R,
    base: u64,
    header: FileHeader,
    nodes: Vec<NodeHeader>,
    first_child: Vec<Option<u32>>,
    next_sibling: Vec<Option<u32>>,
    first_level: Option<u32>,
    metadata: Vec<u8>,
}

fn corrupt(message: impl Into<String>) -> SerializationError {
    SerializationError::Corrupt(message.into())
}

fn section_bounds(offset: i64, size: i64, len: u64, what: &str) -> SerializationResult<()> {
    let end = offset.checked_add(size);
    match end {
        Some(end) if offset >= FILE_HEADER_SIZE as i64 && size >= 0 && end as u64 <= len => Ok(()),
        _ => Err(corrupt(format!("{what} section [{offset}, +{size}) is outside the container"))),
    }
}

impl<R: BinaryReader> ContainerReader<R> {
    /// Open a container starting at the stream's current position.
    pub fn open(mut stream: R) -> SerializationResult<Self> {
        let base = stream.position();
        let available = stream.stream_len().saturating_sub(base);
        if available < FILE_HEADER_SIZE as u64 {
            return Err(SerializationError::NotAContainer);
        }
        let mut raw = [0u8; FILE_HEADER_SIZE];
        stream.read_bytes(&mut raw)?;
        let header = FileHeader::decode(&raw)?;

        section_bounds(header.data_offset, header.data_size, available, "data")?;
        section_bounds(header.metadata_offset, i64::from(header.metadata_size), available, "metadata")?;
        section_bounds(header.nodes_offset, i64::from(header.nodes_size), available, "node")?;

        let mut metadata = vec![0u8; header.metadata_size as usize];
        stream.set_position(base + header.metadata_offset as u64)?;
        stream.read_bytes(&mut metadata)?;

        let mut node_bytes = vec![0u8; header.nodes_size as usize];
        stream.set_position(base + header.nodes_offset as u64)?;
        stream.read_bytes(&mut node_bytes)?;

        let mut nodes = Vec::new();
        let mut offsets = Vec::new();
        let mut cursor = 0usize;
        while cursor < node_bytes.len() {
            let rest = node_bytes.get(cursor..).unwrap_or_default();
            if rest.len() < NODE_HEADER_SIZE {
                return Err(corrupt(format!("{} trailing bytes in node section", rest.len())));
            }
            let node = NodeHeader::decode(rest)?;
            offsets.push(cursor);
            cursor += node.header_size as usize;
            nodes.push(node);
        }

        let mut reader = Self {
            stream,
            base,
            first_child: vec![None; nodes.len()],
            next_sibling: vec![None; nodes.len()],
            first_level: None,
            nodes,
            header,
            metadata,
        };
        reader.link(&offsets)?;
        debug!(
            nodes = reader.nodes.len(),
            file_type = %reader.header.file_type,
            "opened container"
        );
        Ok(reader)
    }

    /// Check the pre-order layout and build the child and sibling links.
    fn link(&mut self, offsets: &[usize]) -> SerializationResult<()> {
        let count = usize::try_from(self.header.first_level_node_count)
            .map_err(|_| corrupt("negative first-level node count"))?;
        let mut next = 0usize;
        self.first_level = self.link_children(count, &mut next, offsets, 0)?;
        if next != self.nodes.len() {
            return Err(corrupt(format!(
                "{} node headers are not reachable from the root",
                self.nodes.len() - next
            )));
        }
        Ok(())
    }

    /// Link `count` siblings starting at node `*next`, recursing into their
    /// subtrees. Returns the first sibling.
    fn link_children(
        &mut self,
        count: usize,
        next: &mut usize,
        offsets: &[usize],
        depth: usize,
    ) -> SerializationResult<Option<u32>> {
        if depth >= MAX_NODE_DEPTH {
            return Err(corrupt(format!("node tree deeper than {MAX_NODE_DEPTH}")));
        }
        let mut first = None;
        let mut previous: Option<usize> = None;
        for remaining in (0..count).rev() {
            let index = *next;
            let node = *self
                .nodes
                .get(index)
                .ok_or_else(|| corrupt("child count exceeds the number of node headers"))?;
            self.check_segments(&node)?;
            *next += 1;

            let children = usize::try_from(node.child_count)
                .map_err(|_| corrupt(format!("node {index} has a negative child count")))?;
            self.first_child[index] = self.link_children(children, next, offsets, depth + 1)?;

            let expected = if remaining == 0 {
                -1
            } else {
                offsets
                    .get(*next)
                    .map_or(-1, |&offset| offset as i32)
            };
            if node.next_sibling_offset != expected {
                return Err(corrupt(format!(
                    "node {index} has sibling offset {}, expected {expected}",
                    node.next_sibling_offset
                )));
            }

            match previous {
                Some(previous) => self.next_sibling[previous] = Some(index as u32),
                None => first = Some(index as u32),
            }
            previous = Some(index);
        }
        Ok(first)
    }

    fn check_segments(&self, node: &NodeHeader) -> SerializationResult<()> {
        let within = |segment: Segment, len: i64| {
            !segment.is_present() || (segment.size >= 0 && segment.end() <= len)
        };
        if !within(node.data, self.header.data_size) {
            return Err(corrupt(format!(
                "data segment [{}, +{}) is outside the data section",
                node.data.offset, node.data.size
            )));
        }
        if !within(node.metadata, self.metadata.len() as i64) {
            return Err(corrupt(format!(
                "metadata segment [{}, +{}) is outside the metadata section",
                node.metadata.offset, node.metadata.size
            )));
        }
        Ok(())
    }

    fn node(&self, node: NodeRef) -> SerializationResult<&NodeHeader> {
        node.index()
            .and_then(|index| self.nodes.get(index))
            .ok_or_else(|| corrupt(format!("invalid node reference {}", node.0)))
    }

    #[must_use]
    pub const fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Number of nodes in the container.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn first_child(&self, parent: NodeRef) -> Option<NodeRef> {
        let first = match parent.index() {
            None => self.first_level,
            Some(index) => *self.first_child.get(index)?,
        };
        first.map(|index| NodeRef::from_index(index as usize))
    }

    #[must_use]
    pub fn next_sibling(&self, node: NodeRef) -> Option<NodeRef> {
        let index = node.index()?;
        self.next_sibling
            .get(index)
            .copied()
            .flatten()
            .map(|next| NodeRef::from_index(next as usize))
    }

    /// Advance `cursor` to the next child of `parent`, starting with the
    /// first child when `cursor` is `None`. Returns false once the children
    /// are exhausted.
    pub fn move_to_next_child(&self, parent: NodeRef, cursor: &mut Option<NodeRef>) -> bool {
        let next = match *cursor {
            None => self.first_child(parent),
            Some(current) => self.next_sibling(current),
        };
        match next {
            Some(node) => {
                *cursor = Some(node);
                true
            }
            None => false,
        }
    }

    pub fn children(&self, parent: NodeRef) -> NodeChildren<'_, R> {
        NodeChildren {
            reader: self,
            next: self.first_child(parent),
        }
    }

    /// Breadth-first search below `start` for the first node matching
    /// `predicate`.
    ///
    /// All direct children are checked before any grandchild. `depth_limit`
    /// 1 means direct children only; 0 finds nothing.
    pub fn find_node(
        &self,
        start: NodeRef,
        depth_limit: usize,
        predicate: &impl Fn(&NodeHeader) -> bool,
    ) -> Option<NodeRef> {
        if depth_limit == 0 {
            return None;
        }
        let found = self
            .children(start)
            .find(|&child| self.node(child).is_ok_and(predicate));
        if found.is_some() {
            return found;
        }
        self.children(start)
            .find_map(|child| self.find_node(child, depth_limit - 1, predicate))
    }

    #[must_use]
    pub fn find_node_by_type(&self, start: NodeRef, node_type: NodeType, depth_limit: usize) -> Option<NodeRef> {
        self.find_node_by_hash(start, node_type.type_hash(), depth_limit)
    }

    #[must_use]
    pub fn find_node_by_hash(&self, start: NodeRef, type_hash: u64, depth_limit: usize) -> Option<NodeRef> {
        self.find_node(start, depth_limit, &|node: &NodeHeader| node.type_hash == type_hash)
    }

    #[must_use]
    pub fn find_node_by_id(&self, start: NodeRef, id: Uuid, depth_limit: usize) -> Option<NodeRef> {
        self.find_node(start, depth_limit, &|node: &NodeHeader| node.id == id)
    }

    pub fn node_info(&self, node: NodeRef) -> SerializationResult<NodeInfo> {
        let header = self.node(node)?;
        Ok(NodeInfo {
            node_type: header.node_type(),
            type_hash: header.type_hash,
            id: header.id,
            child_count: header.child_count,
            data_len: if header.data.is_present() { header.data.size as u64 } else { 0 },
            has_metadata: header.metadata.is_present(),
            extension: header.extension,
        })
    }

    pub fn node_type(&self, node: NodeRef) -> SerializationResult<Option<NodeType>> {
        Ok(self.node(node)?.node_type())
    }

    /// Revision or record count of a node.
    pub fn extension(&self, node: NodeRef) -> SerializationResult<i32> {
        Ok(self.node(node)?.extension)
    }

    pub fn data_len(&self, node: NodeRef) -> SerializationResult<usize> {
        Ok(self.node_info(node)?.data_len as usize)
    }

    fn data_position(&self, segment: Segment) -> u64 {
        self.base + self.header.data_offset as u64 + segment.offset as u64
    }

    /// Read the start of a node's data into `buf`.
    pub fn read_data(&mut self, node: NodeRef, buf: &mut [u8]) -> SerializationResult<()> {
        let segment = self.node(node)?.data;
        let available = if segment.is_present() { segment.size as usize } else { 0 };
        if buf.len() > available {
            return Err(SerializationError::SizeMismatch {
                what: String::from("node data read"),
                expected: available,
                actual: buf.len(),
            });
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.stream.set_position(self.data_position(segment))?;
        self.stream.read_bytes(buf)?;
        Ok(())
    }

    /// Read all of a node's data.
    pub fn read_data_to_vec(&mut self, node: NodeRef) -> SerializationResult<Vec<u8>> {
        let mut buf = vec![0u8; self.data_len(node)?];
        self.read_data(node, &mut buf)?;
        Ok(buf)
    }

    /// A read command covering all of a node's data.
    pub fn prefetch(&self, node: NodeRef) -> SerializationResult<ReadCommand> {
        let segment = self.node(node)?.data;
        if !segment.is_present() {
            return Ok(ReadCommand::new(self.data_position(Segment { offset: 0, size: 0 }), 0));
        }
        Ok(ReadCommand::new(self.data_position(segment), segment.size as usize))
    }

    /// A read command filling `buffer` from `offset` bytes into a node's data.
    pub fn prefetch_range(&self, node: NodeRef, offset: usize, buffer: Vec<u8>) -> SerializationResult<ReadCommand> {
        let segment = self.node(node)?.data;
        let available = if segment.is_present() { segment.size as usize } else { 0 };
        if offset + buffer.len() > available {
            return Err(SerializationError::SizeMismatch {
                what: String::from("node data range"),
                expected: available,
                actual: offset + buffer.len(),
            });
        }
        let position = self.data_position(Segment {
            offset: segment.offset.max(0) + offset as i64,
            size: 0,
        });
        Ok(ReadCommand::with_buffer(position, buffer))
    }

    /// Execute read commands against the underlying stream.
    pub fn read_batch(&mut self, commands: Vec<ReadCommand>) -> SerializationResult<Vec<ReadCommand>> {
        Ok(self.stream.read_batch(commands)?)
    }

    /// A node's metadata payload, checked against its header.
    pub fn read_metadata(&self, node: NodeRef) -> SerializationResult<Option<&[u8]>> {
        let segment = self.node(node)?.metadata;
        if !segment.is_present() {
            return Ok(None);
        }
        let record = self
            .metadata
            .get(segment.offset as usize..segment.end() as usize)
            .ok_or_else(|| corrupt("metadata segment out of range"))?;
        let header: BlobHeader = record
            .get(..BLOB_HEADER_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .ok_or_else(|| corrupt("metadata record shorter than its header"))?;
        let payload = record
            .get(BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + header.length as usize)
            .ok_or_else(|| corrupt("metadata length exceeds its segment"))?;
        if fnv1a64(payload) != header.hash {
            return Err(corrupt("metadata hash mismatch"));
        }
        Ok(Some(payload))
    }

    pub fn stream_mut(&mut self) -> &mut R {
        &mut self.stream
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

/// Iterator over the children of a node.
pub struct NodeChildren<'a, R: BinaryReader> {
    reader: &'a ContainerReader<R>,
    next: Option<NodeRef>,
}

impl<R: BinaryReader> Iterator for NodeChildren<'_, R> {
    type Item = NodeRef;

    fn next(&mut self) -> Option<NodeRef> {
        let current = self.next?;
        self.next = self.reader.next_sibling(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{ContainerConfig, ContainerWriter},
        stream::{MemoryBinaryReader, MemoryBinaryWriter},
    };

    fn tree() -> Vec<u8> {
        let mut w = ContainerWriter::new(MemoryBinaryWriter::new(), ContainerConfig::new("test")).unwrap();
        w.create_node(NodeType::Folder, Uuid::from_u128(1)).unwrap();
        w.set_metadata(b"folder meta").unwrap();
        w.write_node(NodeType::RawData, Uuid::from_u128(2), 4, b"first").unwrap();
        w.create_node(NodeType::Folder, Uuid::from_u128(3)).unwrap();
        w.write_node(NodeType::RawData, Uuid::from_u128(4), 0, b"nested").unwrap();
        w.end_node().unwrap();
        w.end_node().unwrap();
        w.write_node(NodeType::Prefab, Uuid::from_u128(5), 1, b"second").unwrap();
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn test_navigation() {
        let bytes = tree();
        let reader = ContainerReader::open(MemoryBinaryReader::new(&bytes)).unwrap();
        assert_eq!(reader.node_count(), 5);

        let top: Vec<NodeRef> = reader.children(NodeRef::ROOT).collect();
        assert_eq!(top.len(), 2);
        let folder = reader.node_info(top[0]).unwrap();
        assert_eq!(folder.node_type, Some(NodeType::Folder));
        assert_eq!(folder.child_count, 2);

        let mut cursor = None;
        let mut ids = Vec::new();
        while reader.move_to_next_child(top[0], &mut cursor) {
            ids.push(reader.node_info(cursor.unwrap()).unwrap().id);
        }
        assert_eq!(ids, [Uuid::from_u128(2), Uuid::from_u128(3)]);
    }

    #[test]
    fn test_find_respects_depth() {
        let bytes = tree();
        let reader = ContainerReader::open(MemoryBinaryReader::new(&bytes)).unwrap();
        let nested = Uuid::from_u128(4);
        assert!(reader.find_node_by_id(NodeRef::ROOT, nested, 2).is_none());
        assert!(reader.find_node_by_id(NodeRef::ROOT, nested, 3).is_some());
        let prefab = reader.find_node_by_type(NodeRef::ROOT, NodeType::Prefab, 1).unwrap();
        assert_eq!(reader.extension(prefab).unwrap(), 1);
    }

    #[test]
    fn test_read_data_and_metadata() {
        let bytes = tree();
        let mut reader = ContainerReader::open(MemoryBinaryReader::new(&bytes)).unwrap();
        let folder = reader.first_child(NodeRef::ROOT).unwrap();
        assert_eq!(reader.read_metadata(folder).unwrap(), Some(&b"folder meta"[..]));

        let nested = reader.find_node_by_id(NodeRef::ROOT, Uuid::from_u128(4), 3).unwrap();
        assert_eq!(reader.read_data_to_vec(nested).unwrap(), b"nested");
        assert_eq!(reader.read_metadata(nested).unwrap(), None);

        let mut too_big = [0u8; 7];
        assert!(matches!(
            reader.read_data(nested, &mut too_big),
            Err(SerializationError::SizeMismatch { expected: 6, actual: 7, .. })
        ));
    }

    #[test]
    fn test_prefetch_batch() {
        let bytes = tree();
        let mut reader = ContainerReader::open(MemoryBinaryReader::new(&bytes)).unwrap();
        let first = reader.find_node_by_id(NodeRef::ROOT, Uuid::from_u128(2), 2).unwrap();
        let second = reader.find_node_by_id(NodeRef::ROOT, Uuid::from_u128(5), 1).unwrap();
        let commands = vec![
            reader.prefetch(second).unwrap(),
            reader.prefetch_range(first, 1, vec![0; 3]).unwrap(),
        ];
        let done = reader.read_batch(commands).unwrap();
        assert_eq!(done[0].buffer, b"second");
        assert_eq!(done[1].buffer, b"irs");
    }

    #[test]
    fn test_corrupt_sibling_offset() {
        let mut bytes = tree();
        let header = FileHeader::decode(&bytes).unwrap();
        // next_sibling_offset of the first node
        let at = header.nodes_offset as usize + 28;
        bytes[at..at + 4].copy_from_slice(&12345i32.to_le_bytes());
        assert!(matches!(
            ContainerReader::open(MemoryBinaryReader::new(&bytes)),
            Err(SerializationError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let bytes = tree();
        assert!(ContainerReader::open(MemoryBinaryReader::new(&bytes[..bytes.len() - 10])).is_err());
        assert!(matches!(
            ContainerReader::open(MemoryBinaryReader::new(&bytes[..20])),
            Err(SerializationError::NotAContainer)
        ));
    }
}
