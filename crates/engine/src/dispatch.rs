//! Chunk dispatch for one upload run.
//!
//! A run is driven by a single tokio task. It keeps up to
//! `concurrent_uploads` transfers in a [`JoinSet`], applies each result to
//! the registry, and exits when the run is cancelled (pause, failure,
//! cancel) or there is nothing left to send. Exiting drops the `JoinSet`,
//! which aborts any transfer still running.

use std::sync::Arc;

use chunkup_protocol::ChunkUploadResponse;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::finalize;
use crate::server::UploadServer;
use crate::task::{ChunkJob, RunHandle, Step};
use crate::uploader::Shared;

/// How one chunk transfer ended.
#[derive(Debug)]
enum ChunkOutcome {
    Sent(ChunkUploadResponse),
    Failed(TaskError),
    /// Cancelled before a response arrived.
    Aborted,
}

/// Starts the driver for `run`.
pub(crate) fn spawn(shared: Arc<Shared>, file_id: String, run: RunHandle) {
    tokio::spawn(drive(shared, file_id, run));
}

async fn drive(shared: Arc<Shared>, file_id: String, run: RunHandle) {
    let Ok(permits) = shared.registry.read(&file_id, |e| Arc::clone(&e.permits)) else {
        return;
    };
    debug!(file_id = %file_id, run = run.id, "dispatch started");

    let mut transfers: JoinSet<(u32, ChunkOutcome)> = JoinSet::new();

    loop {
        let wants_more = shared
            .registry
            .read(&file_id, |e| e.can_dispatch(&run))
            .unwrap_or(false);
        if transfers.is_empty() && !wants_more {
            break;
        }

        tokio::select! {
            biased;

            _ = run.token.cancelled() => break,

            Some(joined) = transfers.join_next() => {
                let (index, outcome) = match joined {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        warn!(file_id = %file_id, error = %e, "chunk transfer panicked");
                        let _ = shared.registry.update(&file_id, |entry| {
                            entry.record_failure(None, TaskError::Internal(e.to_string()))
                        });
                        break;
                    }
                };
                if let Some(finalize_run) = apply(&shared, &file_id, index, outcome) {
                    finalize::run(&shared, &file_id, finalize_run).await;
                    break;
                }
            }

            permit = Arc::clone(&permits).acquire_owned(), if wants_more => {
                let Ok(permit) = permit else { break };
                let job = shared
                    .registry
                    .update(&file_id, |entry| entry.next_chunk(&run))
                    .ok()
                    .flatten();
                if let Some(job) = job {
                    let server = Arc::clone(&shared.server);
                    transfers.spawn(transfer(server, job, permit));
                }
            }
        }
    }

    debug!(file_id = %file_id, run = run.id, "dispatch stopped");
}

/// Applies one transfer outcome. Returns the finalization run when this
/// chunk completed the upload.
fn apply(shared: &Shared, file_id: &str, index: u32, outcome: ChunkOutcome) -> Option<RunHandle> {
    let step = match outcome {
        ChunkOutcome::Sent(resp) => shared
            .registry
            .update(file_id, |entry| entry.record_success(index, resp)),
        ChunkOutcome::Failed(error) => {
            warn!(file_id = %file_id, chunk = index, error = %error, "chunk failed");
            shared
                .registry
                .update(file_id, |entry| {
                    entry.record_failure(Some(index), error);
                })
                .map(|()| Step::Continue)
        }
        ChunkOutcome::Aborted => shared
            .registry
            .update(file_id, |entry| entry.record_aborted(index))
            .map(|()| Step::Continue),
    };
    match step {
        Ok(Step::Finalize(run)) => Some(run),
        _ => None,
    }
}

/// Reads and sends one chunk, holding `permit` until the request settles.
async fn transfer(
    server: Arc<dyn UploadServer>,
    job: ChunkJob,
    permit: OwnedSemaphorePermit,
) -> (u32, ChunkOutcome) {
    let _permit = permit;
    let index = job.range.index;
    let cancel = job.cancel.clone();

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => ChunkOutcome::Aborted,
        outcome = send(server.as_ref(), job) => outcome,
    };
    (index, outcome)
}

async fn send(server: &dyn UploadServer, job: ChunkJob) -> ChunkOutcome {
    let index = job.range.index;

    let data = tokio::task::spawn_blocking({
        let source = Arc::clone(&job.source);
        let range = job.range;
        move || source.read_range(&range)
    })
    .await;
    let data = match data {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => {
            return ChunkOutcome::Failed(TaskError::Source {
                chunk_index: index,
                message: e.to_string(),
            });
        }
        Err(e) => {
            return ChunkOutcome::Failed(TaskError::Internal(format!("read task failed: {e}")));
        }
    };

    match server.upload_chunk(job.request, data).await {
        Ok(resp) if !resp.received => ChunkOutcome::Failed(TaskError::Transport {
            chunk_index: index,
            message: "server did not acknowledge the chunk".into(),
        }),
        Ok(resp) if resp.chunk_index != index => ChunkOutcome::Failed(TaskError::Transport {
            chunk_index: index,
            message: format!("server acknowledged chunk {} instead", resp.chunk_index),
        }),
        Ok(resp) => ChunkOutcome::Sent(resp),
        Err(e) => ChunkOutcome::Failed(TaskError::Transport {
            chunk_index: index,
            message: e.to_string(),
        }),
    }
}
