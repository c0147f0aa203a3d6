//! Caller-facing upload engine.

use std::path::Path;
use std::sync::Arc;

use chunkup_protocol::{FinalFileRecord, UploadStatus};
use chunkup_transfer::{
    ByteSource, ChunkPlan, FileDescriptor, FileSource, TransferError, validate_file,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dispatch;
use crate::error::EngineError;
use crate::finalize;
use crate::http::HttpServer;
use crate::persist::Persister;
use crate::registry::{ErrorCallback, RegistryEvent, TaskRegistry};
use crate::server::{ServerError, UploadServer};
use crate::store::{JsonDirStore, RecordStore};
use crate::task::{StartOutcome, TaskEntry, UploadTask};

/// A file offered to [`Uploader::submit`].
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    pub source: Arc<dyn ByteSource>,
}

impl FileUpload {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        source: Arc<dyn ByteSource>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            source,
        }
    }

    /// Opens a file on disk, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, TransferError> {
        let source = FileSource::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(name, mime_type, Arc::new(source)))
    }
}

/// Per-file result of [`Uploader::submit`].
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted { file_id: String },
    Rejected { name: String, error: EngineError },
}

impl SubmitOutcome {
    pub fn file_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted { file_id } => Some(file_id),
            SubmitOutcome::Rejected { .. } => None,
        }
    }
}

/// State shared by the facade, dispatch drivers and finalizers.
pub(crate) struct Shared {
    pub registry: TaskRegistry,
    pub server: Arc<dyn UploadServer>,
    pub store: Arc<dyn RecordStore>,
    pub config: EngineConfig,
}

/// Resumable chunked upload engine.
///
/// Cloning is cheap; clones share the same tasks. Must be created and used
/// inside a tokio runtime.
#[derive(Clone)]
pub struct Uploader {
    shared: Arc<Shared>,
}

impl Uploader {
    /// Creates an engine talking to `server` and persisting into `store`.
    pub fn new(
        config: EngineConfig,
        server: Arc<dyn UploadServer>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let persister = Persister::spawn(Arc::clone(&store));
        Ok(Self {
            shared: Arc::new(Shared {
                registry: TaskRegistry::new(Some(persister)),
                server,
                store,
                config,
            }),
        })
    }

    /// Creates an engine using HTTP endpoints and the JSON record store from
    /// `config`.
    pub fn with_http(config: EngineConfig) -> Result<Self, EngineError> {
        let server = HttpServer::new(&config.server)?;
        let store = JsonDirStore::in_namespace(&config.storage_namespace)?;
        Self::new(config, Arc::new(server), Arc::new(store))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Validates, registers and starts uploading each file.
    ///
    /// Rejected files are reported in the result and never reach the server.
    pub fn submit(&self, files: Vec<FileUpload>) -> Vec<SubmitOutcome> {
        files.into_iter().map(|f| self.submit_one(f)).collect()
    }

    fn submit_one(&self, file: FileUpload) -> SubmitOutcome {
        let config = &self.shared.config;
        let descriptor = FileDescriptor {
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.source.len(),
        };

        let plan = validate_file(&descriptor, config.max_file_size, &config.allowed_file_types)
            .map_err(EngineError::from)
            .and_then(|()| Ok(ChunkPlan::new(descriptor.size, config.chunk_size)?));
        let plan = match plan {
            Ok(plan) => plan,
            Err(error) => {
                info!(name = %file.name, error = %error, "file rejected");
                return SubmitOutcome::Rejected {
                    name: file.name,
                    error,
                };
            }
        };

        let file_id = uuid::Uuid::new_v4().to_string();
        info!(
            file_id = %file_id,
            name = %file.name,
            size = descriptor.size,
            chunks = plan.total(),
            "upload queued"
        );
        self.shared.registry.insert(TaskEntry::new(
            file_id.clone(),
            file.name.clone(),
            file.mime_type,
            plan,
            file.source,
            config.concurrent_uploads,
        ));

        if let Err(error) = self.start(&file_id) {
            // Only reachable if the task was cancelled in between.
            warn!(file_id = %file_id, error = %error, "could not start upload");
        }
        SubmitOutcome::Accepted { file_id }
    }

    /// Opens a run for `file_id` and spawns whatever it needs.
    fn start(&self, file_id: &str) -> Result<(), EngineError> {
        let outcome = self.shared.registry.update(file_id, |e| e.start_run())??;
        match outcome {
            StartOutcome::Dispatch(run) => {
                debug!(file_id = %file_id, run = run.id, "starting dispatch");
                dispatch::spawn(Arc::clone(&self.shared), file_id.to_string(), run);
            }
            StartOutcome::Finalize(run) => {
                debug!(file_id = %file_id, "all chunks present, finalizing");
                finalize::spawn(Arc::clone(&self.shared), file_id.to_string(), run);
            }
            StartOutcome::AlreadyRunning => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Stops dispatch and aborts in-flight chunks. Uploaded chunks are kept.
    pub fn pause(&self, file_id: &str) -> Result<(), EngineError> {
        self.shared.registry.update(file_id, |e| e.pause())??;
        info!(file_id = %file_id, "upload paused");
        Ok(())
    }

    /// Continues a paused or failed upload from the chunks still missing.
    ///
    /// Restored tasks are first reconciled with the server's view of the
    /// session. A session the server no longer knows restarts the upload
    /// from scratch.
    pub async fn resume(&self, file_id: &str) -> Result<(), EngineError> {
        let registry = &self.shared.registry;
        let reconcile = registry.read(file_id, |e| e.prepare_resume())??;

        if let Some(upload_id) = reconcile {
            match self.shared.server.resume_info(upload_id.clone()).await {
                Ok(info) => {
                    debug!(
                        file_id = %file_id,
                        received = info.chunks_received.len(),
                        "reconciled with server"
                    );
                    registry.update(file_id, |e| e.apply_resume_info(info))?;
                }
                Err(ServerError::UnknownUpload(_)) => {
                    let stale = EngineError::StaleRecord { upload_id };
                    warn!(file_id = %file_id, error = %stale, "starting a fresh upload");
                    registry.update(file_id, |e| {
                        if e.needs_reconcile {
                            e.reset_session();
                        }
                    })?;
                }
                Err(e) => {
                    warn!(
                        file_id = %file_id,
                        error = %e,
                        "resume-info failed, continuing with local chunk state"
                    );
                }
            }
        }

        self.start(file_id)?;
        info!(file_id = %file_id, "upload resumed");
        Ok(())
    }

    /// Aborts and forgets a task that has not finished.
    pub fn cancel(&self, file_id: &str) -> Result<(), EngineError> {
        self.shared.registry.remove_if(file_id, |e| {
            if e.task.status.is_terminal() {
                Err(e.invalid("cancel"))
            } else {
                Ok(())
            }
        })?;
        info!(file_id = %file_id, "upload cancelled");
        Ok(())
    }

    /// Supplies the bytes of a restored task.
    pub fn attach_source(
        &self,
        file_id: &str,
        source: Arc<dyn ByteSource>,
    ) -> Result<(), EngineError> {
        self.shared
            .registry
            .update(file_id, |e| e.attach_source(source))?
    }

    /// Repeats the completion call of a task whose chunks are all uploaded.
    pub fn retry_finalize(&self, file_id: &str) -> Result<(), EngineError> {
        let run = self.shared.registry.update(file_id, |e| e.retry_finalize())??;
        info!(file_id = %file_id, "retrying finalization");
        finalize::spawn(Arc::clone(&self.shared), file_id.to_string(), run);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn snapshot(&self, file_id: &str) -> Option<UploadTask> {
        self.shared.registry.get(file_id)
    }

    /// All tasks, in submission order.
    pub fn snapshots(&self) -> Vec<UploadTask> {
        self.shared.registry.snapshots()
    }

    /// Receives every task change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.registry.subscribe()
    }

    /// Registers a callback for tasks entering the `error` state.
    pub fn on_error(&self, callback: ErrorCallback) {
        self.shared.registry.add_error_callback(callback);
    }

    /// Waits until `file_id` completes, fails or is removed.
    pub async fn wait(&self, file_id: &str) -> Result<FinalFileRecord, EngineError> {
        let registry = &self.shared.registry;
        let mut rx = registry.subscribe();

        let Some(task) = registry.get(file_id) else {
            return Err(EngineError::NotFound(file_id.to_string()));
        };
        if let Some(result) = settled(&task) {
            return result;
        }

        loop {
            match rx.recv().await {
                Ok(RegistryEvent::Updated(task)) if task.file_id == file_id => {
                    if let Some(result) = settled(&task) {
                        return result;
                    }
                }
                Ok(RegistryEvent::Removed { file_id: id }) if id == file_id => {
                    return Err(EngineError::Cancelled);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => match registry.get(file_id) {
                    Some(task) => {
                        if let Some(result) = settled(&task) {
                            return result;
                        }
                    }
                    None => return Err(EngineError::Cancelled),
                },
                Err(RecvError::Closed) => return Err(EngineError::Cancelled),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Removes one finished (`complete` or `error`) task.
    pub fn clear_entry(&self, file_id: &str) -> Result<(), EngineError> {
        self.shared.registry.remove_if(file_id, |e| {
            if e.task.status.is_terminal() {
                Ok(())
            } else {
                Err(e.invalid("clear"))
            }
        })?;
        Ok(())
    }

    /// Removes every finished task. Returns the removed ids.
    pub fn clear_all(&self) -> Vec<String> {
        self.shared.registry.remove_terminal()
    }

    /// Registers placeholders for the uploads recorded in the store.
    ///
    /// Completed records are purged. Restored tasks have no byte source:
    /// call [`attach_source`](Self::attach_source) before resuming.
    pub async fn restore(&self) -> Result<Vec<UploadTask>, EngineError> {
        let store = Arc::clone(&self.shared.store);
        let records = tokio::task::spawn_blocking(move || store.load_all())
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))??;

        let registry = &self.shared.registry;
        let config = &self.shared.config;
        let mut restored = Vec::new();

        for record in records {
            if registry.contains(&record.file_id) {
                continue;
            }
            if record.status == UploadStatus::Complete {
                if let Some(persister) = registry.persister() {
                    persister.remove(&record.file_id);
                }
                continue;
            }

            // Uploaded indices only make sense under the chunk size they
            // were planned with.
            let chunk_size = record.chunk_size.unwrap_or(config.chunk_size);
            let plan = match ChunkPlan::new(record.file_size, chunk_size) {
                Ok(plan) if plan.total() > 0 => plan,
                Ok(_) => {
                    warn!(file_id = %record.file_id, "skipping record of an empty file");
                    continue;
                }
                Err(e) => {
                    warn!(file_id = %record.file_id, error = %e, "skipping unplannable record");
                    continue;
                }
            };

            let entry = TaskEntry::restore(record, plan, config.concurrent_uploads);
            info!(
                file_id = %entry.task.file_id,
                name = %entry.task.file_name,
                status = %entry.task.status,
                progress = entry.task.progress,
                "restored upload"
            );
            restored.push(entry.task.clone());
            registry.insert(entry);
        }

        Ok(restored)
    }

    /// Waits for every queued record write to reach the store.
    pub async fn flush(&self) {
        if let Some(persister) = self.shared.registry.persister() {
            persister.flush().await;
        }
    }
}

/// Maps a finished snapshot to the result of [`Uploader::wait`].
fn settled(task: &UploadTask) -> Option<Result<FinalFileRecord, EngineError>> {
    match task.status {
        UploadStatus::Complete => Some(task.final_file.clone().ok_or_else(|| {
            EngineError::Finalization("completed without a file record".into())
        })),
        UploadStatus::Error => Some(Err(task
            .error
            .clone()
            .map(EngineError::from)
            .unwrap_or_else(|| EngineError::Transport("unknown failure".into())))),
        _ => None,
    }
}
