//! Chunk planning, file validation and byte sources for resumable uploads.

mod plan;
mod source;
mod validation;

pub use plan::{ChunkPlan, ChunkRange};
pub use source::{ByteSource, FileSource, MemorySource};
pub use validation::{FileDescriptor, ValidationError, validate_file};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("file needs {0} chunks, more than a plan can index")]
    TooManyChunks(u64),

    #[error("range ends at {end} but source is {len} bytes")]
    OutOfRange { end: u64, len: u64 },
}
