//! Upload server abstraction.
//!
//! `UploadServer` is the seam between the engine and the network. The
//! engine only ever talks to the three endpoints below; `HttpServer` is the
//! production implementation and tests substitute in-memory mocks.

use std::future::Future;
use std::pin::Pin;

use chunkup_protocol::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
    ResumeInfoResponse,
};

/// Boxed future returned by [`UploadServer`] methods.
pub type ServerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServerError>> + Send + 'a>>;

/// Errors from an upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upload session {0} is unknown")]
    UnknownUpload(String),

    #[error("{0}")]
    Other(String),
}

/// The three endpoints a resumable upload needs.
///
/// Dropping a returned future must abandon the request; the engine relies on
/// this to abort in-flight chunks on pause and cancel.
pub trait UploadServer: Send + Sync {
    /// Sends one chunk. When `request.upload_id` is `None` the server
    /// allocates a session and returns its id.
    fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        data: Vec<u8>,
    ) -> ServerFuture<'_, ChunkUploadResponse>;

    /// Asks the server to assemble all chunks into the final file.
    fn complete(&self, request: CompleteUploadRequest) -> ServerFuture<'_, CompleteUploadResponse>;

    /// Returns the chunk indices the server holds for `upload_id`.
    ///
    /// Fails with [`ServerError::UnknownUpload`] when the session has expired
    /// or never existed.
    fn resume_info(&self, upload_id: String) -> ServerFuture<'_, ResumeInfoResponse>;
}
