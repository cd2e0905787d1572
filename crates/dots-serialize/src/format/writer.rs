//! Container writer.

use dots_ecs::encode_blob_record;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    header::{FILE_HEADER_SIZE, FileHeader},
    node::{NodeHeader, NodeType, Segment},
};
use crate::{
    SerializationError, SerializationResult,
    paged::{DEFAULT_PAGE_SIZE, PagedAllocation, Reservation},
    stream::BinaryWriter,
};

/// Container writer settings.
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    /// Free-form file type, truncated to 62 bytes of UTF-8.
    pub file_type: String,
    pub file_id: Uuid,
    /// Page size of the node header arena.
    pub page_size: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            file_type: String::from("dots"),
            file_id: Uuid::nil(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ContainerConfig {
    #[must_use]
    pub fn new(file_type: impl Into<String>) -> Self {
        Self {
            file_type: file_type.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_file_id(mut self, file_id: Uuid) -> Self {
        self.file_id = file_id;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Handle of a node created by a [`ContainerWriter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle(usize);

struct NodeEntry {
    node_type: NodeType,
    id: Uuid,
    header: Reservation,
    next_sibling: Option<usize>,
    last_child: Option<usize>,
    child_count: i32,
    metadata: Segment,
    data: Segment,
    extension: i32,
    /// Buffered data of a deferred node, flushed when the node ends.
    deferred: Option<Vec<u8>>,
}

/// Writes a node tree.
///
/// Data is streamed straight to the output after a placeholder header.
/// Metadata and node headers are kept in memory and appended by
/// [`Self::write_header`], which then seeks back and fills in the header:
///
/// ```text
/// [header][data segments][metadata segments][node headers, pre-order]
/// ```
///
/// Only the innermost open node accepts direct data writes, and only until
/// its first child is created; a deferred node buffers its data instead and
/// may keep receiving writes while it has children.
pub struct ContainerWriter<W: BinaryWriter> {
    stream: W,
    config: ContainerConfig,
    base: u64,
    headers: PagedAllocation,
    nodes: Vec<NodeEntry>,
    stack: Vec<usize>,
    last_first_level: Option<usize>,
    first_level_count: i32,
    metadata: Vec<u8>,
    data_len: u64,
    finished: bool,
}

impl<W: BinaryWriter> ContainerWriter<W> {
    /// Start a container at the stream's current position.
    pub fn new(mut stream: W, config: ContainerConfig) -> SerializationResult<Self> {
        let base = stream.position();
        stream.write_bytes(&[0; FILE_HEADER_SIZE])?;
        Ok(Self {
            stream,
            headers: PagedAllocation::new(config.page_size),
            config,
            base,
            nodes: Vec::new(),
            stack: Vec::new(),
            last_first_level: None,
            first_level_count: 0,
            metadata: Vec::new(),
            data_len: 0,
            finished: false,
        })
    }

    /// Open a child of the current node (or a first-level node).
    pub fn create_node(&mut self, node_type: NodeType, id: Uuid) -> SerializationResult<NodeHandle> {
        self.open(node_type, id, None)
    }

    /// Open a node whose data is buffered and written when it ends.
    pub fn create_deferred_node(&mut self, node_type: NodeType, id: Uuid) -> SerializationResult<NodeHandle> {
        self.open(node_type, id, Some(Vec::new()))
    }

    fn open(&mut self, node_type: NodeType, id: Uuid, deferred: Option<Vec<u8>>) -> SerializationResult<NodeHandle> {
        if self.finished {
            return Err(SerializationError::WriterFinished);
        }
        let header = self.headers.reserve(node_type.layout().header_size());
        let index = self.nodes.len();
        self.nodes.push(NodeEntry {
            node_type,
            id,
            header,
            next_sibling: None,
            last_child: None,
            child_count: 0,
            metadata: Segment::ABSENT,
            data: Segment::ABSENT,
            extension: 0,
            deferred,
        });

        let previous = match self.stack.last() {
            Some(&parent) => {
                let parent = &mut self.nodes[parent];
                parent.child_count += 1;
                parent.last_child.replace(index)
            }
            None => {
                self.first_level_count += 1;
                self.last_first_level.replace(index)
            }
        };
        if let Some(previous) = previous {
            self.nodes[previous].next_sibling = Some(index);
        }

        trace!(node = node_type.name(), depth = self.stack.len(), "created node");
        self.stack.push(index);
        Ok(NodeHandle(index))
    }

    fn current(&self) -> SerializationResult<usize> {
        if self.finished {
            return Err(SerializationError::WriterFinished);
        }
        self.stack.last().copied().ok_or(SerializationError::NodeNotOpen)
    }

    /// The innermost open node.
    #[must_use]
    pub fn current_node(&self) -> Option<NodeHandle> {
        self.stack.last().copied().map(NodeHandle)
    }

    /// Number of open nodes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Append to the current node's data.
    pub fn write_data(&mut self, bytes: &[u8]) -> SerializationResult<()> {
        let index = self.current()?;
        let node = &mut self.nodes[index];
        if let Some(buffer) = node.deferred.as_mut() {
            buffer.extend_from_slice(bytes);
            return Ok(());
        }
        if node.child_count > 0 {
            return Err(SerializationError::InterleavedWrite);
        }
        if !node.data.is_present() {
            node.data = Segment {
                offset: self.data_len as i64,
                size: 0,
            };
        }
        self.stream.write_bytes(bytes)?;
        node.data.size += bytes.len() as i64;
        self.data_len += bytes.len() as u64;
        Ok(())
    }

    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) -> SerializationResult<()> {
        self.write_data(bytemuck::bytes_of(value))
    }

    pub fn write_pod_slice<T: bytemuck::Pod>(&mut self, values: &[T]) -> SerializationResult<()> {
        self.write_data(bytemuck::cast_slice(values))
    }

    /// Append to an open deferred node, which need not be the current one.
    pub fn write_deferred(&mut self, node: NodeHandle, bytes: &[u8]) -> SerializationResult<()> {
        if self.finished {
            return Err(SerializationError::WriterFinished);
        }
        if !self.stack.contains(&node.0) {
            return Err(SerializationError::NodeNotOpen);
        }
        match self.nodes[node.0].deferred.as_mut() {
            Some(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(SerializationError::InterleavedWrite),
        }
    }

    /// Attach metadata to the current node.
    ///
    /// Metadata is one-shot: returns `Ok(false)` and changes nothing if the
    /// node already has some.
    pub fn set_metadata(&mut self, bytes: &[u8]) -> SerializationResult<bool> {
        let index = self.current()?;
        let node = &mut self.nodes[index];
        if node.metadata.is_present() {
            return Ok(false);
        }
        let record = encode_blob_record(bytes);
        node.metadata = Segment {
            offset: self.metadata.len() as i64,
            size: record.len() as i64,
        };
        self.metadata.extend_from_slice(&record);
        Ok(true)
    }

    /// Set the revision or count field of the current node.
    ///
    /// Ignored for node types without one.
    pub fn set_extension(&mut self, value: i32) -> SerializationResult<()> {
        let index = self.current()?;
        self.nodes[index].extension = value;
        Ok(())
    }

    /// Set the revision or count field of any open node.
    pub fn set_extension_of(&mut self, node: NodeHandle, value: i32) -> SerializationResult<()> {
        if !self.stack.contains(&node.0) {
            return Err(SerializationError::NodeNotOpen);
        }
        self.nodes[node.0].extension = value;
        Ok(())
    }

    /// Close the current node.
    pub fn end_node(&mut self) -> SerializationResult<()> {
        let index = self.current()?;
        self.stack.pop();
        if let Some(buffer) = self.nodes[index].deferred.take() {
            if !buffer.is_empty() {
                self.stream.write_bytes(&buffer)?;
                self.nodes[index].data = Segment {
                    offset: self.data_len as i64,
                    size: buffer.len() as i64,
                };
                self.data_len += buffer.len() as u64;
            }
        }
        Ok(())
    }

    /// Create a node, write its data and close it.
    pub fn write_node(&mut self, node_type: NodeType, id: Uuid, extension: i32, data: &[u8]) -> SerializationResult<()> {
        self.create_node(node_type, id)?;
        self.set_extension(extension)?;
        self.write_data(data)?;
        self.end_node()
    }

    /// Append metadata and node headers, then back-patch the file header.
    ///
    /// Every node must be closed. Nothing can be written afterwards.
    pub fn write_header(&mut self) -> SerializationResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.stack.is_empty() {
            return Err(SerializationError::UnbalancedNode(self.stack.len()));
        }

        for node in &self.nodes {
            let header = NodeHeader {
                type_hash: node.node_type.type_hash(),
                id: node.id,
                header_size: node.header.len() as i32,
                next_sibling_offset: node
                    .next_sibling
                    .map_or(-1, |next| self.nodes[next].header.global_offset() as i32),
                child_count: node.child_count,
                metadata: node.metadata,
                data: node.data,
                extension: node.extension,
            };
            header.encode(self.headers.get_mut(node.header))?;
        }

        let data_offset = FILE_HEADER_SIZE as i64;
        let metadata_offset = data_offset + self.data_len as i64;
        let nodes_offset = metadata_offset + self.metadata.len() as i64;

        self.stream.write_bytes(&self.metadata)?;
        for bytes in self.headers.iter() {
            self.stream.write_bytes(bytes)?;
        }

        let header = FileHeader {
            first_level_node_count: self.first_level_count,
            nodes_offset,
            nodes_size: self.headers.global_offset() as i32,
            metadata_offset,
            metadata_size: self.metadata.len() as i32,
            data_offset,
            data_size: self.data_len as i64,
            ..FileHeader::new(self.config.file_id, &self.config.file_type)
        };
        let end = self.stream.position();
        self.stream.set_position(self.base)?;
        self.stream.write_bytes(&header.encode()?)?;
        self.stream.set_position(end)?;
        self.finished = true;

        debug!(
            nodes = self.nodes.len(),
            data = self.data_len,
            metadata = self.metadata.len(),
            headers = self.headers.global_offset(),
            "finished container"
        );
        Ok(())
    }

    /// Return the stream of a finished container.
    pub fn into_inner(self) -> SerializationResult<W> {
        if self.finished {
            Ok(self.stream)
        } else {
            Err(SerializationError::WriterNotFinished)
        }
    }

    /// Write the header and return the stream.
    pub fn finish(mut self) -> SerializationResult<W> {
        self.write_header()?;
        self.into_inner()
    }
}
