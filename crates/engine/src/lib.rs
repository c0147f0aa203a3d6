//! Resumable chunked upload engine.
//!
//! An [`Uploader`] accepts files, splits them into fixed-size chunks and
//! sends those chunks to an [`UploadServer`] with bounded concurrency. Each
//! upload can be paused, resumed and cancelled; its progress is persisted to
//! a [`RecordStore`] so that it can be picked up again after a restart. Once
//! every chunk has been accepted the server is asked to assemble the file.
//!
//! ```no_run
//! # async fn demo() -> Result<(), chunkup_engine::EngineError> {
//! use chunkup_engine::{EngineConfig, FileUpload, Uploader};
//!
//! let uploader = Uploader::with_http(EngineConfig::load()?)?;
//! let file = FileUpload::from_path("video.mp4".as_ref())?;
//! for outcome in uploader.submit(vec![file]) {
//!     if let Some(id) = outcome.file_id() {
//!         let record = uploader.wait(id).await?;
//!         println!("uploaded to {}", record.url);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
mod dispatch;
pub mod error;
mod finalize;
pub mod http;
#[cfg(test)]
mod mock;
mod persist;
mod registry;
pub mod server;
pub mod store;
mod task;
mod uploader;

pub use config::{EngineConfig, ServerConfig};
pub use error::{EngineError, TaskError};
pub use http::HttpServer;
pub use registry::{ErrorCallback, RegistryEvent};
pub use server::{ServerError, ServerFuture, UploadServer};
pub use store::{JsonDirStore, MemoryStore, RecordStore, StoreError};
pub use task::UploadTask;
pub use uploader::{FileUpload, SubmitOutcome, Uploader};

pub use chunkup_protocol::{FinalFileRecord, PersistedUploadRecord, UploadStatus};
pub use chunkup_transfer::{ByteSource, FileSource, MemorySource};
