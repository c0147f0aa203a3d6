//! Completion call for a fully uploaded task.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::TaskError;
use crate::task::RunHandle;
use crate::uploader::Shared;

/// Asks the server to assemble the file, then records the outcome.
///
/// The call is abandoned if `run` is cancelled first (the task was
/// cancelled or removed), in which case nothing is recorded.
pub(crate) async fn run(shared: &Shared, file_id: &str, run: RunHandle) {
    let Ok(Some(request)) = shared.registry.read(file_id, |e| e.completion_request()) else {
        let _ = shared.registry.update(file_id, |e| {
            e.finish_finalize(
                &run,
                Err(TaskError::Finalization("no upload session to complete".into())),
            )
        });
        return;
    };

    let result = tokio::select! {
        biased;
        _ = run.token.cancelled() => return,
        r = shared.server.complete(request) => r,
    };

    let result = result.map_err(|e| {
        warn!(file_id = %file_id, error = %e, "completion failed");
        TaskError::Finalization(e.to_string())
    });
    if let Ok(resp) = &result {
        info!(file_id = %file_id, server_id = %resp.file_id, url = %resp.file_url, "upload complete");
    }

    let _ = shared
        .registry
        .update(file_id, |e| e.finish_finalize(&run, result));
}

/// Runs [`run`] on its own task.
pub(crate) fn spawn(shared: Arc<Shared>, file_id: String, run: RunHandle) {
    tokio::spawn(async move { self::run(&shared, &file_id, run).await });
}
