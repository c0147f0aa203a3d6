//! Engine error types.

use chunkup_transfer::{TransferError, ValidationError};

use crate::server::ServerError;
use crate::store::StoreError;

/// Errors returned by the engine's caller-facing operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("chunk transport failed: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("finalization failed: {0}")]
    Finalization(String),

    #[error("upload session {upload_id} is no longer known to the server")]
    StaleRecord { upload_id: String },

    #[error("no upload task with id {0}")]
    NotFound(String),

    #[error("task {file_id} is {status}, cannot {action}")]
    InvalidState {
        file_id: String,
        status: chunkup_protocol::UploadStatus,
        action: &'static str,
    },

    #[error("task {0} has no byte source; attach the file again before resuming")]
    SourceRequired(String),

    #[error("source for task {file_id} is {actual} bytes, expected {expected}")]
    SourceMismatch {
        file_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure recorded on a task in the `error` state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("chunk {chunk_index} failed: {message}")]
    Transport { chunk_index: u32, message: String },

    #[error("could not read chunk {chunk_index}: {message}")]
    Source { chunk_index: u32, message: String },

    #[error("completion failed: {0}")]
    Finalization(String),

    #[error("upload was interrupted before the process exited")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TaskError> for EngineError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Finalization(msg) => EngineError::Finalization(msg),
            // Only a completion call can be left interrupted.
            TaskError::Interrupted => {
                EngineError::Finalization(TaskError::Interrupted.to_string())
            }
            other => EngineError::Transport(other.to_string()),
        }
    }
}
