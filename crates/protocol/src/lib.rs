//! Wire and persistence types shared by the chunkup crates.

pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
    ResumeInfoResponse,
};
pub use types::{FinalFileRecord, PersistedUploadRecord, UploadStatus};
