//! Seekable byte streams.
//!
//! Everything above this module talks to a [`BinaryWriter`] or
//! [`BinaryReader`]: sequential transfer from the current position plus
//! absolute seeks. Reads and writes either move exactly the requested number
//! of bytes or fail; there are no partial results.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian};
use bytemuck::Pod;

use crate::batch::ReadCommand;

/// Internal buffer size of the file-backed streams.
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Sequential writer with random access.
pub trait BinaryWriter {
    /// Write all of `bytes` at the current position.
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Current byte offset.
    fn position(&self) -> u64;

    /// Move to an absolute byte offset.
    fn set_position(&mut self, position: u64) -> io::Result<()>;
}

/// Sequential reader with random access.
pub trait BinaryReader {
    /// Fill `buf` from the current position.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Current byte offset.
    fn position(&self) -> u64;

    /// Move to an absolute byte offset.
    fn set_position(&mut self, position: u64) -> io::Result<()>;

    /// Total length of the stream in bytes.
    fn stream_len(&self) -> u64;

    /// Execute a batch of independent reads and hand the filled buffers back
    /// in submission order. The stream position is left unchanged.
    fn read_batch(&mut self, mut commands: Vec<ReadCommand>) -> io::Result<Vec<ReadCommand>> {
        let resume = self.position();
        for command in &mut commands {
            self.set_position(command.offset)?;
            self.read_bytes(&mut command.buffer)?;
        }
        self.set_position(resume)?;
        Ok(commands)
    }
}

/// Little-endian typed writes.
pub trait BinaryWriterExt: BinaryWriter {
    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(&buf)
    }

    fn write_i32(&mut self, value: i32) -> io::Result<()> {
        let mut buf = [0; 4];
        LittleEndian::write_i32(&mut buf, value);
        self.write_bytes(&buf)
    }

    fn write_u64(&mut self, value: u64) -> io::Result<()> {
        let mut buf = [0; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_bytes(&buf)
    }

    fn write_i64(&mut self, value: i64) -> io::Result<()> {
        let mut buf = [0; 8];
        LittleEndian::write_i64(&mut buf, value);
        self.write_bytes(&buf)
    }

    fn write_pod<T: Pod>(&mut self, value: &T) -> io::Result<()> {
        self.write_bytes(bytemuck::bytes_of(value))
    }

    fn write_pod_slice<T: Pod>(&mut self, values: &[T]) -> io::Result<()> {
        self.write_bytes(bytemuck::cast_slice(values))
    }
}

impl<W: BinaryWriter + ?Sized> BinaryWriterExt for W {}

/// Little-endian typed reads.
pub trait BinaryReaderExt: BinaryReader {
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn read_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0; 4];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i32(&buf))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0; 8];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    fn read_i64(&mut self) -> io::Result<i64> {
        let mut buf = [0; 8];
        self.read_bytes(&mut buf)?;
        Ok(LittleEndian::read_i64(&buf))
    }

    fn read_pod<T: Pod>(&mut self) -> io::Result<T> {
        let mut value = T::zeroed();
        self.read_bytes(bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    fn read_pod_vec<T: Pod>(&mut self, count: usize) -> io::Result<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        self.read_bytes(bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }
}

impl<R: BinaryReader + ?Sized> BinaryReaderExt for R {}

fn to_index(position: u64) -> io::Result<usize> {
    usize::try_from(position)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position exceeds address space"))
}

// ==================== Memory ====================

/// Growable in-memory stream. Seeking past the end and writing zero-fills
/// the gap.
#[derive(Debug, Default, Clone)]
pub struct MemoryBinaryWriter {
    buffer: Vec<u8>,
    position: usize,
}

impl MemoryBinaryWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl BinaryWriter for MemoryBinaryWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let end = self.position + bytes.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        self.position = to_index(position)?;
        Ok(())
    }
}

/// Reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct MemoryBinaryReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> MemoryBinaryReader<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl BinaryReader for MemoryBinaryReader<'_> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let end = self.position + buf.len();
        let Some(source) = self.data.get(self.position..end) else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {} bytes at {} past end {}", buf.len(), self.position, self.data.len()),
            ));
        };
        buf.copy_from_slice(source);
        self.position = end;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position as u64
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        let position = to_index(position)?;
        if position > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("seek to {position} past end {}", self.data.len()),
            ));
        }
        self.position = position;
        Ok(())
    }

    fn stream_len(&self) -> u64 {
        self.data.len() as u64
    }
}

// ==================== Files ====================

/// Buffered file writer.
pub struct StreamBinaryWriter {
    inner: BufWriter<File>,
    position: u64,
}

impl StreamBinaryWriter {
    /// Create (or truncate) a file for writing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_file(File::create(path)?)
    }

    /// Wrap an open file. Writing continues at the file's current offset.
    pub fn from_file(mut file: File) -> io::Result<Self> {
        let position = file.stream_position()?;
        Ok(Self {
            inner: BufWriter::with_capacity(STREAM_BUFFER_SIZE, file),
            position,
        })
    }

    /// Flush buffered bytes and return the file.
    pub fn into_inner(self) -> io::Result<File> {
        self.inner.into_inner().map_err(io::IntoInnerError::into_error)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl BinaryWriter for StreamBinaryWriter {
    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        // BufWriter flushes before seeking.
        self.inner.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }
}

/// Buffered file reader.
pub struct StreamBinaryReader {
    inner: BufReader<File>,
    position: u64,
    len: u64,
}

impl StreamBinaryReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_file(File::open(path)?)
    }

    /// Wrap an open file. Reading continues at the file's current offset.
    pub fn from_file(mut file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        let position = file.stream_position()?;
        Ok(Self {
            inner: BufReader::with_capacity(STREAM_BUFFER_SIZE, file),
            position,
            len,
        })
    }
}

impl BinaryReader for StreamBinaryReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        if position != self.position {
            self.inner.seek(SeekFrom::Start(position))?;
            self.position = position;
        }
        Ok(())
    }

    fn stream_len(&self) -> u64 {
        self.len
    }
}
