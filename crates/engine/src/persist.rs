//! Background writer that applies record snapshots to a [`RecordStore`].
//!
//! Callers enqueue operations without waiting; a single task applies them in
//! order on a blocking thread. Failed writes are logged and dropped.

use std::sync::Arc;

use chunkup_protocol::PersistedUploadRecord;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::store::{RecordStore, StoreError};

enum PersistOp {
    Save(PersistedUploadRecord),
    Remove(String),
    Flush(oneshot::Sender<()>),
}

/// Handle for queuing writes to the background persistence task.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl Persister {
    /// Spawns the writer task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn RecordStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(store, rx));
        Self { tx }
    }

    /// Queues a save of `record`.
    pub fn save(&self, record: PersistedUploadRecord) {
        self.send(PersistOp::Save(record));
    }

    /// Queues removal of the record for `file_id`.
    pub fn remove(&self, file_id: &str) {
        self.send(PersistOp::Remove(file_id.to_string()));
    }

    /// Resolves once every operation queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(PersistOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            warn!("persistence task has stopped, dropping write");
        }
    }
}

async fn run(store: Arc<dyn RecordStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            PersistOp::Save(record) => {
                let file_id = record.file_id.clone();
                let store = Arc::clone(&store);
                let result = blocking(move || store.save(&record)).await;
                if let Err(e) = result {
                    warn!(file_id = %file_id, error = %e, "failed to persist upload record");
                }
            }
            PersistOp::Remove(file_id) => {
                let store = Arc::clone(&store);
                let id = file_id.clone();
                let result = blocking(move || store.remove(&id)).await;
                if let Err(e) = result {
                    warn!(file_id = %file_id, error = %e, "failed to remove upload record");
                }
            }
            PersistOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn blocking<F>(f: F) -> Result<(), StoreError>
where
    F: FnOnce() -> Result<(), StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?
}
