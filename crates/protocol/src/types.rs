use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Paused,
    Processing,
    Complete,
    Error,
}

impl UploadStatus {
    /// Returns `true` for states the engine never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Error)
    }

    /// Returns `true` while `progress` tracks the uploaded chunk ratio.
    pub fn tracks_chunk_progress(self) -> bool {
        matches!(self, UploadStatus::Uploading | UploadStatus::Paused)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Processing => "processing",
            UploadStatus::Complete => "complete",
            UploadStatus::Error => "error",
        };
        f.pad(s)
    }
}

/// Final stored file, produced once the server has assembled all chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalFileRecord {
    pub id: String,
    pub url: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
}

/// Durable subset of an upload task.
///
/// The byte source is deliberately absent: an open file handle cannot be
/// carried across process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUploadRecord {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    /// Chunk size the `chunks_uploaded` indices refer to. Absent in
    /// records written before it was tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub chunks_uploaded: Vec<u32>,
    pub status: UploadStatus,
    #[serde(default)]
    pub progress: u8,
}
