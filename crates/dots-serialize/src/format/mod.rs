//! Node-tree container.
//!
//! A container is a file header followed by three sections. Node data is
//! streamed while the tree is built, so it comes first; metadata and node
//! headers are only known once every node is closed.
//!
//! ```text
//! ┌──────────────┬───────────────────┬───────────────────┬──────────────────┐
//! │ FileHeader   │ data              │ metadata          │ node headers     │
//! │ 140 bytes    │ node payloads     │ {BlobHeader,      │ pre-order, each  │
//! │ magic, ids,  │ in close order    │  padded bytes}    │ with sibling     │
//! │ section offs │                   │ per node          │ offset and counts│
//! └──────────────┴───────────────────┴───────────────────┴──────────────────┘
//! ```
//!
//! Segment offsets inside node headers are relative to their section; the
//! sections' offsets are relative to the start of the container.

mod header;
mod node;
mod reader;
mod string_table;
mod writer;

pub use header::{CURRENT_FILE_FORMAT_VERSION, FILE_HEADER_SIZE, FILE_TYPE_CAPACITY, FileHeader, MAGIC};
pub use node::{NODE_HEADER_SIZE, NodeHeader, NodeLayout, NodeType, Segment};
pub use reader::{ContainerReader, MAX_NODE_DEPTH, NodeChildren, NodeInfo, NodeRef};
pub use string_table::{FixedCapacity, INVALID_OFFSET, INVALID_UTF8, StringTable, StringTableWriter};
pub use writer::{ContainerConfig, ContainerWriter, NodeHandle};

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.get(..end).unwrap_or_default()
}
