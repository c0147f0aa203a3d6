use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunk ingest
// ---------------------------------------------------------------------------

/// Metadata sent alongside the bytes of one chunk.
///
/// The bytes travel as the `chunk` multipart part; these fields are sent as
/// text parts with the same names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadRequest {
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Omitted on the first chunk; the server allocates a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

/// Acknowledges a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received: bool,
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Asks the server to assemble all chunks of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: u32,
}

/// Final file metadata returned by the completion endpoint.
///
/// Only `fileId` and `fileUrl` are required; richer servers echo the final
/// name, type and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub file_id: String,
    pub file_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resume info
// ---------------------------------------------------------------------------

/// Server view of a partially uploaded session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfoResponse {
    #[serde(default)]
    pub chunks_received: Vec<u32>,
    pub total_chunks: u32,
}
