//! Batched reads completed off the calling thread.
//!
//! A batch is a list of `{offset, destination}` commands submitted together.
//! [`AsyncFileReader::submit`] runs the batch on a background thread and
//! returns a [`ReadHandle`]; the handle must be waited on before any of the
//! destination buffers are used.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::stream::{BinaryReader, STREAM_BUFFER_SIZE};

/// One read of `buffer.len()` bytes at an absolute stream offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCommand {
    pub offset: u64,
    pub buffer: Vec<u8>,
}

impl ReadCommand {
    /// A command with a zeroed destination of `size` bytes.
    #[must_use]
    pub fn new(offset: u64, size: usize) -> Self {
        Self {
            offset,
            buffer: vec![0; size],
        }
    }

    /// A command reading into an existing buffer.
    #[must_use]
    pub const fn with_buffer(offset: u64, buffer: Vec<u8>) -> Self {
        Self { offset, buffer }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }
}

struct Completion {
    result: Mutex<Option<io::Result<Vec<ReadCommand>>>>,
    ready: Condvar,
}

/// Completion handle of a submitted batch.
pub struct ReadHandle {
    completion: Arc<Completion>,
}

impl ReadHandle {
    /// Whether the batch has finished (successfully or not).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completion.result.lock().is_some()
    }

    /// Block until the batch finishes and take its buffers.
    pub fn wait(self) -> io::Result<Vec<ReadCommand>> {
        let mut result = self.completion.result.lock();
        loop {
            if let Some(done) = result.take() {
                return done;
            }
            self.completion.ready.wait(&mut result);
        }
    }
}

/// File reader whose batches run on a background thread.
///
/// Sequential reads go through a buffered handle like
/// [`StreamBinaryReader`](crate::StreamBinaryReader); each batch opens its
/// own handle so it never disturbs the sequential cursor.
pub struct AsyncFileReader {
    path: PathBuf,
    file: BufReader<File>,
    position: u64,
    len: u64,
}

impl AsyncFileReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            file: BufReader::with_capacity(STREAM_BUFFER_SIZE, file),
            position: 0,
            len,
        })
    }

    /// Start a batch.
    pub fn submit(&self, commands: Vec<ReadCommand>) -> io::Result<ReadHandle> {
        let completion = Arc::new(Completion {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let shared = Arc::clone(&completion);
        let path = self.path.clone();

        thread::Builder::new()
            .name(String::from("dots-read"))
            .spawn(move || {
                let result = execute(&path, commands);
                *shared.result.lock() = Some(result);
                shared.ready.notify_all();
            })?;
        Ok(ReadHandle { completion })
    }
}

fn execute(path: &Path, mut commands: Vec<ReadCommand>) -> io::Result<Vec<ReadCommand>> {
    let mut file = File::open(path)?;
    // Issue reads in file order; results stay in submission order.
    let mut order: Vec<usize> = (0..commands.len()).collect();
    order.sort_by_key(|&i| commands[i].offset);
    for i in order {
        let command = &mut commands[i];
        file.seek(SeekFrom::Start(command.offset))?;
        file.read_exact(&mut command.buffer)?;
    }
    Ok(commands)
}

impl BinaryReader for AsyncFileReader {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        if position != self.position {
            self.file.seek(SeekFrom::Start(position))?;
            self.position = position;
        }
        Ok(())
    }

    fn stream_len(&self) -> u64 {
        self.len
    }

    fn read_batch(&mut self, commands: Vec<ReadCommand>) -> io::Result<Vec<ReadCommand>> {
        let bytes: usize = commands.iter().map(ReadCommand::size).sum();
        trace!(commands = commands.len(), bytes, "submitting read batch");
        self.submit(commands)?.wait()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn sample_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.bin");
        let mut file = File::create(&path).unwrap();
        let bytes: Vec<u8> = (0..=255).cycle().take(4096).collect();
        file.write_all(&bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_submit_and_wait() {
        let (_dir, path) = sample_file();
        let reader = AsyncFileReader::open(&path).unwrap();

        let handle = reader
            .submit(vec![ReadCommand::new(1000, 4), ReadCommand::new(2, 3)])
            .unwrap();
        let commands = handle.wait().unwrap();

        assert_eq!(commands[0].buffer, vec![232, 233, 234, 235]);
        assert_eq!(commands[1].buffer, vec![2, 3, 4]);
    }

    #[test]
    fn test_batch_past_end_fails() {
        let (_dir, path) = sample_file();
        let reader = AsyncFileReader::open(&path).unwrap();
        let handle = reader.submit(vec![ReadCommand::new(4090, 16)]).unwrap();
        assert!(handle.wait().is_err());
    }

    #[test]
    fn test_sequential_reads_unaffected_by_batch() {
        let (_dir, path) = sample_file();
        let mut reader = AsyncFileReader::open(&path).unwrap();
        let mut first = [0u8; 2];
        reader.read_bytes(&mut first).unwrap();

        let commands = reader.read_batch(vec![ReadCommand::new(300, 1)]).unwrap();
        assert_eq!(commands[0].buffer, vec![44]);

        let mut next = [0u8; 2];
        reader.read_bytes(&mut next).unwrap();
        assert_eq!(first, [0, 1]);
        assert_eq!(next, [2, 3]);
    }
}
