use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::TransferError;
use crate::plan::ChunkRange;

/// Random-access provider of a file's bytes.
///
/// Reads are blocking; async callers should run them on a blocking thread.
pub trait ByteSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads exactly the bytes of `range`.
    fn read_range(&self, range: &ChunkRange) -> Result<Vec<u8>, TransferError>;
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Reads chunks from a file on disk.
///
/// The size is captured at open time; a file that shrinks afterwards makes
/// later reads fail instead of silently yielding a short chunk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self {
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_range(&self, range: &ChunkRange) -> Result<Vec<u8>, TransferError> {
        if range.end > self.size {
            return Err(TransferError::OutOfRange {
                end: range.end,
                len: self.size,
            });
        }

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Serves chunks from an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemorySource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, range: &ChunkRange) -> Result<Vec<u8>, TransferError> {
        let len = self.len();
        if range.end > len || range.start > range.end {
            return Err(TransferError::OutOfRange {
                end: range.end,
                len,
            });
        }
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}
