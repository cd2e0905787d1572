//! File header.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use super::truncate_utf8;
use crate::{SerializationError, SerializationResult};

/// First eight bytes of every container.
pub const MAGIC: [u8; 8] = *b"DOTSBIN!";

/// Format version written by this crate; readers accept nothing else.
pub const CURRENT_FILE_FORMAT_VERSION: i32 = 2;

/// Encoded size of [`FileHeader`].
pub const FILE_HEADER_SIZE: usize = 140;

/// Bytes of UTF-8 the file type slot holds.
pub const FILE_TYPE_CAPACITY: usize = 62;

/// Container file header.
///
/// Section offsets are relative to the start of the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: i32,
    pub header_size: i32,
    pub file_id: Uuid,
    pub file_type: String,
    pub first_level_node_count: i32,
    pub nodes_offset: i64,
    pub nodes_size: i32,
    pub metadata_offset: i64,
    pub metadata_size: i32,
    pub data_offset: i64,
    pub data_size: i64,
}

impl FileHeader {
    /// A header with empty sections.
    #[must_use]
    pub fn new(file_id: Uuid, file_type: &str) -> Self {
        Self {
            format_version: CURRENT_FILE_FORMAT_VERSION,
            header_size: FILE_HEADER_SIZE as i32,
            file_id,
            file_type: truncate_utf8(file_type, FILE_TYPE_CAPACITY).to_owned(),
            first_level_node_count: 0,
            nodes_offset: FILE_HEADER_SIZE as i64,
            nodes_size: 0,
            metadata_offset: FILE_HEADER_SIZE as i64,
            metadata_size: 0,
            data_offset: FILE_HEADER_SIZE as i64,
            data_size: 0,
        }
    }

    pub fn encode(&self) -> SerializationResult<Vec<u8>> {
        let file_type = truncate_utf8(&self.file_type, FILE_TYPE_CAPACITY);
        let mut slot = [0u8; FILE_TYPE_CAPACITY];
        slot[..file_type.len()].copy_from_slice(file_type.as_bytes());

        let mut out = Vec::with_capacity(FILE_HEADER_SIZE);
        out.write_all(&MAGIC)?;
        out.write_i32::<LittleEndian>(self.format_version)?;
        out.write_i32::<LittleEndian>(self.header_size)?;
        out.write_all(self.file_id.as_bytes())?;
        out.write_u16::<LittleEndian>(file_type.len() as u16)?;
        out.write_all(&slot)?;
        out.write_i32::<LittleEndian>(self.first_level_node_count)?;
        out.write_i64::<LittleEndian>(self.nodes_offset)?;
        out.write_i32::<LittleEndian>(self.nodes_size)?;
        out.write_i64::<LittleEndian>(self.metadata_offset)?;
        out.write_i32::<LittleEndian>(self.metadata_size)?;
        out.write_i64::<LittleEndian>(self.data_offset)?;
        out.write_i64::<LittleEndian>(self.data_size)?;
        debug_assert_eq!(out.len(), FILE_HEADER_SIZE);
        Ok(out)
    }

    /// Decode and validate magic and version.
    pub fn decode(bytes: &[u8]) -> SerializationResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE || bytes[..MAGIC.len()] != MAGIC {
            return Err(SerializationError::NotAContainer);
        }
        let mut input = &bytes[MAGIC.len()..];

        let format_version = input.read_i32::<LittleEndian>()?;
        if format_version != CURRENT_FILE_FORMAT_VERSION {
            return Err(SerializationError::VersionMismatch {
                found: format_version,
                expected: CURRENT_FILE_FORMAT_VERSION,
            });
        }
        let header_size = input.read_i32::<LittleEndian>()?;
        if header_size < FILE_HEADER_SIZE as i32 {
            return Err(SerializationError::Corrupt(format!(
                "file header size {header_size} is smaller than {FILE_HEADER_SIZE}"
            )));
        }

        let mut id = [0u8; 16];
        std::io::Read::read_exact(&mut input, &mut id)?;
        let type_len = input.read_u16::<LittleEndian>()? as usize;
        let mut slot = [0u8; FILE_TYPE_CAPACITY];
        std::io::Read::read_exact(&mut input, &mut slot)?;
        let file_type = slot
            .get(..type_len)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .ok_or_else(|| SerializationError::Corrupt(String::from("invalid file type string")))?
            .to_owned();

        Ok(Self {
            format_version,
            header_size,
            file_id: Uuid::from_bytes(id),
            file_type,
            first_level_node_count: input.read_i32::<LittleEndian>()?,
            nodes_offset: input.read_i64::<LittleEndian>()?,
            nodes_size: input.read_i32::<LittleEndian>()?,
            metadata_offset: input.read_i64::<LittleEndian>()?,
            metadata_size: input.read_i32::<LittleEndian>()?,
            data_offset: input.read_i64::<LittleEndian>()?,
            data_size: input.read_i64::<LittleEndian>()?,
        })
    }
}
