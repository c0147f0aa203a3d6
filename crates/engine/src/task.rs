//! Per-file upload state machine.
//!
//! [`UploadTask`] is the immutable snapshot handed to callers. [`TaskEntry`]
//! is the registry-owned mutable state behind it: the chunk plan, the byte
//! source, the cancellation handles of in-flight chunks and the dispatch
//! run currently allowed to issue requests. Every transition lives here as
//! a synchronous method so the registry can apply it under its lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chunkup_protocol::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
    FinalFileRecord, PersistedUploadRecord, ResumeInfoResponse, UploadStatus,
};
use chunkup_transfer::{ByteSource, ChunkPlan, ChunkRange};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{EngineError, TaskError};

/// Caller-visible snapshot of one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadTask {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub chunk_size: u64,
    /// Server session id, assigned by the first chunk response.
    pub upload_id: Option<String>,
    pub chunks_total: u32,
    pub chunks_uploaded: BTreeSet<u32>,
    pub status: UploadStatus,
    /// 0–100.
    pub progress: u8,
    /// Set only while `status == Error`.
    pub error: Option<TaskError>,
    /// Set only once `status == Complete`.
    pub final_file: Option<FinalFileRecord>,
    /// `false` for tasks restored from storage until a source is attached.
    pub has_source: bool,
}

impl UploadTask {
    /// The durable subset of this snapshot.
    pub fn to_record(&self) -> PersistedUploadRecord {
        PersistedUploadRecord {
            file_id: self.file_id.clone(),
            upload_id: self.upload_id.clone(),
            file_name: self.file_name.clone(),
            file_type: self.file_type.clone(),
            file_size: self.file_size,
            chunk_size: Some(self.chunk_size),
            chunks_uploaded: self.chunks_uploaded.iter().copied().collect(),
            status: self.status,
            progress: self.progress,
        }
    }

    /// Returns `true` once every chunk index is on the server.
    pub fn all_chunks_uploaded(&self) -> bool {
        (0..self.chunks_total).all(|i| self.chunks_uploaded.contains(&i))
    }
}

/// Identifies one dispatch run. Only the current run may issue chunks.
#[derive(Debug, Clone)]
pub(crate) struct RunHandle {
    pub id: u64,
    pub token: CancellationToken,
}

/// Everything a transfer needs to send one chunk.
pub(crate) struct ChunkJob {
    pub range: ChunkRange,
    pub request: ChunkUploadRequest,
    pub source: Arc<dyn ByteSource>,
    pub cancel: CancellationToken,
}

/// What a dispatch driver should do after a chunk result is applied.
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    /// This result completed the index set; the caller must finalize
    /// under the returned run.
    Finalize(RunHandle),
}

/// Result of asking a task to (re)start.
#[derive(Debug)]
pub(crate) enum StartOutcome {
    /// A new dispatch run was opened.
    Dispatch(RunHandle),
    /// All chunks are already on the server; finalize directly.
    Finalize(RunHandle),
    /// A run or finalization is already active.
    AlreadyRunning,
}

/// Registry-owned mutable state of one upload.
pub(crate) struct TaskEntry {
    pub task: UploadTask,
    pub plan: ChunkPlan,
    pub source: Option<Arc<dyn ByteSource>>,
    /// Cancellation handle of each chunk currently being sent.
    pub in_flight: BTreeMap<u32, CancellationToken>,
    /// Bounds in-flight transfers across runs.
    pub permits: Arc<Semaphore>,
    pub run: Option<RunHandle>,
    next_run_id: u64,
    /// Guards against a second completion call for the same task.
    pub finalizing: bool,
    /// Set on restored tasks: compare chunk state with the server before
    /// the first resume.
    pub needs_reconcile: bool,
}

impl TaskEntry {
    /// A freshly accepted file, in `queued`.
    pub fn new(
        file_id: String,
        file_name: String,
        file_type: String,
        plan: ChunkPlan,
        source: Arc<dyn ByteSource>,
        concurrency: usize,
    ) -> Self {
        let task = UploadTask {
            file_id,
            file_name,
            file_type,
            file_size: plan.file_size(),
            chunk_size: plan.chunk_size(),
            upload_id: None,
            chunks_total: plan.total(),
            chunks_uploaded: BTreeSet::new(),
            status: UploadStatus::Queued,
            progress: 0,
            error: None,
            final_file: None,
            has_source: true,
        };
        Self::with_task(task, plan, Some(source), concurrency)
    }

    /// A placeholder rebuilt from a persisted record. It has no byte source.
    ///
    /// `plan` must be built with the record's chunk size. A record without
    /// one cannot map its indices to byte ranges and restarts from scratch.
    pub fn restore(record: PersistedUploadRecord, plan: ChunkPlan, concurrency: usize) -> Self {
        let total = plan.total();
        let untracked_chunk_size = record.chunk_size.is_none();
        let chunks_uploaded: BTreeSet<u32> = record
            .chunks_uploaded
            .into_iter()
            .filter(|i| *i < total)
            .collect();

        let (status, error) = match record.status {
            UploadStatus::Error | UploadStatus::Processing => {
                (UploadStatus::Error, Some(TaskError::Interrupted))
            }
            _ => (UploadStatus::Paused, None),
        };

        let task = UploadTask {
            file_id: record.file_id,
            file_name: record.file_name,
            file_type: record.file_type,
            file_size: record.file_size,
            chunk_size: plan.chunk_size(),
            upload_id: record.upload_id,
            chunks_total: total,
            progress: plan.progress(&chunks_uploaded),
            chunks_uploaded,
            status,
            error,
            final_file: None,
            has_source: false,
        };
        let mut entry = Self::with_task(task, plan, None, concurrency);
        if untracked_chunk_size {
            if entry.task.upload_id.is_some() || !entry.task.chunks_uploaded.is_empty() {
                warn!(
                    file_id = %entry.task.file_id,
                    "record has no chunk size, starting over"
                );
            }
            entry.reset_session();
        } else {
            entry.needs_reconcile = entry.task.upload_id.is_some();
        }
        entry
    }

    fn with_task(
        task: UploadTask,
        plan: ChunkPlan,
        source: Option<Arc<dyn ByteSource>>,
        concurrency: usize,
    ) -> Self {
        Self {
            task,
            plan,
            source,
            in_flight: BTreeMap::new(),
            permits: Arc::new(Semaphore::new(concurrency)),
            run: None,
            next_run_id: 0,
            finalizing: false,
            needs_reconcile: false,
        }
    }

    pub fn invalid(&self, action: &'static str) -> EngineError {
        EngineError::InvalidState {
            file_id: self.task.file_id.clone(),
            status: self.task.status,
            action,
        }
    }

    fn recompute_progress(&mut self) {
        self.task.progress = self.plan.progress(&self.task.chunks_uploaded);
    }

    // -----------------------------------------------------------------------
    // Start / pause
    // -----------------------------------------------------------------------

    /// Moves a queued, paused or failed task back into dispatch.
    pub fn start_run(&mut self) -> Result<StartOutcome, EngineError> {
        match self.task.status {
            UploadStatus::Uploading | UploadStatus::Processing => {
                return Ok(StartOutcome::AlreadyRunning);
            }
            UploadStatus::Complete => return Err(self.invalid("resume")),
            UploadStatus::Queued | UploadStatus::Paused | UploadStatus::Error => {}
        }
        if self.finalizing {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if self.plan.is_covered(&self.task.chunks_uploaded) {
            self.task.error = None;
            return Ok(StartOutcome::Finalize(self.begin_finalize()));
        }

        if self.source.is_none() {
            return Err(EngineError::SourceRequired(self.task.file_id.clone()));
        }

        self.task.error = None;
        self.task.status = UploadStatus::Uploading;
        self.recompute_progress();
        Ok(StartOutcome::Dispatch(self.open_run()))
    }

    /// Replaces the current run with a fresh one.
    fn open_run(&mut self) -> RunHandle {
        if let Some(old) = self.run.take() {
            old.token.cancel();
        }
        self.next_run_id += 1;
        let run = RunHandle {
            id: self.next_run_id,
            token: CancellationToken::new(),
        };
        self.run = Some(run.clone());
        run
    }

    /// Stops dispatch and aborts every in-flight chunk.
    pub fn pause(&mut self) -> Result<(), EngineError> {
        if !matches!(
            self.task.status,
            UploadStatus::Uploading | UploadStatus::Queued
        ) {
            return Err(self.invalid("pause"));
        }
        self.abort_all();
        self.task.status = UploadStatus::Paused;
        Ok(())
    }

    /// Cancels the current run and every chunk it has in flight.
    ///
    /// In-flight handles are dropped immediately; the aborted transfers keep
    /// their concurrency permits until their futures are gone.
    pub fn abort_all(&mut self) {
        if let Some(run) = self.run.take() {
            run.token.cancel();
        }
        for (_, token) in std::mem::take(&mut self.in_flight) {
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Returns `true` if `run` has been neither replaced nor cancelled.
    pub fn is_current(&self, run: &RunHandle) -> bool {
        self.run.as_ref().is_some_and(|r| r.id == run.id) && !run.token.is_cancelled()
    }

    fn next_pending(&self) -> Option<u32> {
        // Until the server has assigned a session id, only one chunk may be
        // in flight so that every chunk lands in the same session.
        if self.task.upload_id.is_none() && !self.in_flight.is_empty() {
            return None;
        }
        self.plan
            .pending(&self.task.chunks_uploaded)
            .find(|i| !self.in_flight.contains_key(i))
    }

    /// Returns `true` if `run` could dispatch another chunk right now.
    pub fn can_dispatch(&self, run: &RunHandle) -> bool {
        self.task.status == UploadStatus::Uploading
            && self.is_current(run)
            && self.source.is_some()
            && self.next_pending().is_some()
    }

    /// Claims the next pending chunk for `run`.
    pub fn next_chunk(&mut self, run: &RunHandle) -> Option<ChunkJob> {
        if !self.can_dispatch(run) {
            return None;
        }
        let source = self.source.clone()?;
        let index = self.next_pending()?;
        let range = self.plan.chunk(index)?;

        let cancel = run.token.child_token();
        self.in_flight.insert(index, cancel.clone());

        Some(ChunkJob {
            range,
            request: ChunkUploadRequest {
                file_name: self.task.file_name.clone(),
                chunk_index: index,
                total_chunks: self.task.chunks_total,
                upload_id: self.task.upload_id.clone(),
            },
            source,
            cancel,
        })
    }

    /// Applies a confirmed chunk.
    pub fn record_success(&mut self, index: u32, resp: ChunkUploadResponse) -> Step {
        self.in_flight.remove(&index);
        if !self.task.status.tracks_chunk_progress() {
            return Step::Continue;
        }

        match &self.task.upload_id {
            None => self.task.upload_id = Some(resp.upload_id),
            Some(existing) if *existing != resp.upload_id => {
                warn!(
                    file_id = %self.task.file_id,
                    expected = %existing,
                    got = %resp.upload_id,
                    "server answered with a different upload id, keeping the first"
                );
            }
            Some(_) => {}
        }

        if index < self.task.chunks_total {
            self.task.chunks_uploaded.insert(index);
        }
        self.recompute_progress();

        if self.task.status == UploadStatus::Uploading
            && !self.finalizing
            && self.plan.is_covered(&self.task.chunks_uploaded)
        {
            return Step::Finalize(self.begin_finalize());
        }
        Step::Continue
    }

    /// Applies a failed chunk. Returns `true` if the task moved to `error`.
    pub fn record_failure(&mut self, index: Option<u32>, error: TaskError) -> bool {
        if let Some(index) = index {
            self.in_flight.remove(&index);
        }
        if self.task.status != UploadStatus::Uploading {
            return false;
        }
        self.abort_all();
        self.task.status = UploadStatus::Error;
        self.task.error = Some(error);
        true
    }

    /// Forgets an aborted chunk. Aborts never touch the uploaded set.
    pub fn record_aborted(&mut self, index: u32) {
        self.in_flight.remove(&index);
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Ends chunk dispatch and opens the run the completion call belongs to.
    fn begin_finalize(&mut self) -> RunHandle {
        self.task.status = UploadStatus::Processing;
        self.finalizing = true;
        self.open_run()
    }

    /// Request for the completion endpoint, while `processing`.
    pub fn completion_request(&self) -> Option<CompleteUploadRequest> {
        if self.task.status != UploadStatus::Processing {
            return None;
        }
        Some(CompleteUploadRequest {
            upload_id: self.task.upload_id.clone()?,
            file_name: self.task.file_name.clone(),
            total_chunks: self.task.chunks_total,
        })
    }

    /// Applies the completion result of `run`.
    pub fn finish_finalize(
        &mut self,
        run: &RunHandle,
        result: Result<CompleteUploadResponse, TaskError>,
    ) {
        if !self.is_current(run) || self.task.status != UploadStatus::Processing {
            return;
        }
        self.finalizing = false;
        self.run = None;
        match result {
            Ok(resp) => {
                self.task.final_file = Some(FinalFileRecord {
                    id: resp.file_id,
                    url: resp.file_url,
                    name: resp.file_name.unwrap_or_else(|| self.task.file_name.clone()),
                    mime_type: resp.file_type.unwrap_or_else(|| self.task.file_type.clone()),
                    size: resp.file_size.unwrap_or(self.task.file_size),
                });
                self.task.status = UploadStatus::Complete;
                self.task.progress = 100;
                self.task.error = None;
                // The byte source is no longer needed.
                self.source = None;
            }
            Err(error) => {
                self.task.status = UploadStatus::Error;
                self.task.error = Some(error);
            }
        }
    }

    /// Re-arms finalization after a failed completion call.
    pub fn retry_finalize(&mut self) -> Result<RunHandle, EngineError> {
        if self.task.status != UploadStatus::Error
            || self.finalizing
            || !self.plan.is_covered(&self.task.chunks_uploaded)
        {
            return Err(self.invalid("retry finalization"));
        }
        self.task.error = None;
        Ok(self.begin_finalize())
    }

    // -----------------------------------------------------------------------
    // Restore support
    // -----------------------------------------------------------------------

    /// Installs a byte source for a restored task.
    pub fn attach_source(&mut self, source: Arc<dyn ByteSource>) -> Result<(), EngineError> {
        if matches!(
            self.task.status,
            UploadStatus::Uploading | UploadStatus::Processing | UploadStatus::Complete
        ) {
            return Err(self.invalid("attach a source"));
        }
        let actual = source.len();
        if actual != self.task.file_size {
            return Err(EngineError::SourceMismatch {
                file_id: self.task.file_id.clone(),
                expected: self.task.file_size,
                actual,
            });
        }
        self.source = Some(source);
        self.task.has_source = true;
        Ok(())
    }

    /// Checks that `resume` may proceed and returns the session to reconcile.
    pub fn prepare_resume(&self) -> Result<Option<String>, EngineError> {
        match self.task.status {
            UploadStatus::Uploading | UploadStatus::Processing => return Ok(None),
            UploadStatus::Complete => return Err(self.invalid("resume")),
            _ => {}
        }
        if self.source.is_none() && !self.plan.is_covered(&self.task.chunks_uploaded) {
            return Err(EngineError::SourceRequired(self.task.file_id.clone()));
        }
        if self.needs_reconcile {
            Ok(self.task.upload_id.clone())
        } else {
            Ok(None)
        }
    }

    /// Replaces local chunk state with the server's view.
    pub fn apply_resume_info(&mut self, info: ResumeInfoResponse) {
        if !self.needs_reconcile {
            // Another resume already reconciled this task.
            return;
        }
        self.needs_reconcile = false;
        if info.total_chunks != self.plan.total() {
            warn!(
                file_id = %self.task.file_id,
                server_total = info.total_chunks,
                local_total = self.plan.total(),
                "server chunk count differs from local plan, starting over"
            );
            self.reset_session();
            return;
        }
        let total = self.plan.total();
        self.task.chunks_uploaded = info
            .chunks_received
            .into_iter()
            .filter(|i| *i < total)
            .collect();
        self.recompute_progress();
    }

    /// Forgets the server session so the next run starts a fresh upload.
    pub fn reset_session(&mut self) {
        self.needs_reconcile = false;
        self.task.upload_id = None;
        self.task.chunks_uploaded.clear();
        self.task.progress = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkup_transfer::MemorySource;

    fn entry(size: usize, chunk_size: u64) -> TaskEntry {
        let plan = ChunkPlan::new(size as u64, chunk_size).unwrap();
        TaskEntry::new(
            "f1".into(),
            "data.bin".into(),
            "application/octet-stream".into(),
            plan,
            Arc::new(MemorySource::new(vec![7u8; size])),
            3,
        )
    }

    fn ack(index: u32) -> ChunkUploadResponse {
        ChunkUploadResponse {
            upload_id: "up-1".into(),
            chunk_index: index,
            received: true,
        }
    }

    fn started(e: &mut TaskEntry) -> RunHandle {
        match e.start_run().unwrap() {
            StartOutcome::Dispatch(run) => run,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn new_task_is_queued() {
        let e = entry(100, 25);
        assert_eq!(e.task.status, UploadStatus::Queued);
        assert_eq!(e.task.chunks_total, 4);
        assert_eq!(e.task.progress, 0);
    }

    #[test]
    fn first_chunk_gates_window_until_upload_id() {
        let mut e = entry(100, 25);
        let run = started(&mut e);

        let first = e.next_chunk(&run).unwrap();
        assert_eq!(first.request.chunk_index, 0);
        assert_eq!(first.request.upload_id, None);
        assert!(e.next_chunk(&run).is_none());

        assert!(matches!(e.record_success(0, ack(0)), Step::Continue));
        let a = e.next_chunk(&run).unwrap();
        let b = e.next_chunk(&run).unwrap();
        assert_eq!((a.request.chunk_index, b.request.chunk_index), (1, 2));
        assert_eq!(a.request.upload_id.as_deref(), Some("up-1"));
    }

    #[test]
    fn out_of_order_completion_finalizes_once() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_success(0, ack(0));
        for _ in 1..4 {
            e.next_chunk(&run).unwrap();
        }

        assert!(matches!(e.record_success(3, ack(3)), Step::Continue));
        assert!(matches!(e.record_success(1, ack(1)), Step::Continue));
        assert!(matches!(e.record_success(2, ack(2)), Step::Finalize(_)));
        assert_eq!(e.task.status, UploadStatus::Processing);
        // A late duplicate confirmation does not finalize again.
        assert!(matches!(e.record_success(2, ack(2)), Step::Continue));
        assert_eq!(e.task.chunks_uploaded.len(), 4);
    }

    #[test]
    fn progress_tracks_uploaded_ratio() {
        let mut e = entry(90, 30);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_success(0, ack(0));
        assert_eq!(e.task.progress, 33);
    }

    #[test]
    fn pause_aborts_in_flight_and_blocks_dispatch() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        let job = e.next_chunk(&run).unwrap();

        e.pause().unwrap();
        assert_eq!(e.task.status, UploadStatus::Paused);
        assert!(job.cancel.is_cancelled());
        assert!(run.token.is_cancelled());
        assert!(e.in_flight.is_empty());
        assert!(e.next_chunk(&run).is_none());
        assert!(matches!(e.pause(), Err(EngineError::InvalidState { .. })));
    }

    #[test]
    fn stale_run_cannot_dispatch_after_resume() {
        let mut e = entry(100, 25);
        let old = started(&mut e);
        e.pause().unwrap();
        let new = started(&mut e);

        assert!(e.next_chunk(&old).is_none());
        assert!(e.next_chunk(&new).is_some());
    }

    #[test]
    fn resume_skips_uploaded_chunks() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_success(0, ack(0));
        e.next_chunk(&run).unwrap();
        e.record_success(1, ack(1));
        e.pause().unwrap();

        let run = started(&mut e);
        let a = e.next_chunk(&run).unwrap();
        let b = e.next_chunk(&run).unwrap();
        assert_eq!((a.request.chunk_index, b.request.chunk_index), (2, 3));
        assert!(e.next_chunk(&run).is_none());
    }

    #[test]
    fn start_while_uploading_is_noop() {
        let mut e = entry(100, 25);
        started(&mut e);
        assert!(matches!(e.start_run().unwrap(), StartOutcome::AlreadyRunning));
    }

    #[test]
    fn aborted_chunk_is_not_recorded() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_aborted(0);
        assert!(e.task.chunks_uploaded.is_empty());
        assert!(e.in_flight.is_empty());
    }

    #[test]
    fn failure_moves_to_error_and_aborts_siblings() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_success(0, ack(0));
        let sibling = e.next_chunk(&run).unwrap();
        e.next_chunk(&run).unwrap();

        let err = TaskError::Transport {
            chunk_index: 2,
            message: "reset".into(),
        };
        assert!(e.record_failure(Some(2), err.clone()));
        assert_eq!(e.task.status, UploadStatus::Error);
        assert_eq!(e.task.error, Some(err));
        assert!(sibling.cancel.is_cancelled());
        // A second failure from a sibling is ignored.
        assert!(!e.record_failure(Some(1), TaskError::Internal("late".into())));
    }

    #[test]
    fn finalize_success_forces_full_progress() {
        let mut e = entry(10, 10);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        let Step::Finalize(fin) = e.record_success(0, ack(0)) else {
            panic!("expected finalize");
        };
        let req = e.completion_request().unwrap();
        assert_eq!(req.upload_id, "up-1");
        assert_eq!(req.total_chunks, 1);

        e.finish_finalize(&fin, Ok(CompleteUploadResponse {
            file_id: "srv-9".into(),
            file_url: "/files/srv-9".into(),
            file_name: None,
            file_type: None,
            file_size: None,
        }));
        assert_eq!(e.task.status, UploadStatus::Complete);
        assert_eq!(e.task.progress, 100);
        let final_file = e.task.final_file.as_ref().unwrap();
        assert_eq!(final_file.name, "data.bin");
        assert_eq!(final_file.size, 10);
    }

    #[test]
    fn finalize_failure_can_be_retried() {
        let mut e = entry(10, 10);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        let Step::Finalize(fin) = e.record_success(0, ack(0)) else {
            panic!("expected finalize");
        };
        e.finish_finalize(&fin, Err(TaskError::Finalization("503".into())));
        assert_eq!(e.task.status, UploadStatus::Error);

        let retry = e.retry_finalize().unwrap();
        assert!(!e.is_current(&fin));
        assert!(e.is_current(&retry));
        assert_eq!(e.task.status, UploadStatus::Processing);
        assert!(e.finalizing);
        assert!(e.retry_finalize().is_err());
    }

    #[test]
    fn retry_finalize_requires_full_coverage() {
        let mut e = entry(100, 25);
        let run = started(&mut e);
        e.next_chunk(&run).unwrap();
        e.record_failure(Some(0), TaskError::Internal("x".into()));
        assert!(e.retry_finalize().is_err());
    }

    fn record(status: UploadStatus, chunks: Vec<u32>) -> PersistedUploadRecord {
        PersistedUploadRecord {
            file_id: "f1".into(),
            upload_id: Some("up-1".into()),
            file_name: "data.bin".into(),
            file_type: "application/octet-stream".into(),
            file_size: 100,
            chunk_size: Some(25),
            chunks_uploaded: chunks,
            status,
            progress: 0,
        }
    }

    #[test]
    fn restored_task_needs_source() {
        let plan = ChunkPlan::new(100, 25).unwrap();
        let mut e = TaskEntry::restore(record(UploadStatus::Uploading, vec![0, 1, 9]), plan, 3);
        assert_eq!(e.task.status, UploadStatus::Paused);
        assert_eq!(e.task.chunks_uploaded, BTreeSet::from([0, 1]));
        assert_eq!(e.task.progress, 50);
        assert!(!e.task.has_source);
        assert!(e.needs_reconcile);

        assert!(matches!(e.prepare_resume(), Err(EngineError::SourceRequired(_))));
        assert!(matches!(e.start_run(), Err(EngineError::SourceRequired(_))));

        let wrong = Arc::new(MemorySource::new(vec![0u8; 99]));
        assert!(matches!(
            e.attach_source(wrong),
            Err(EngineError::SourceMismatch { .. })
        ));
        e.attach_source(Arc::new(MemorySource::new(vec![0u8; 100])))
            .unwrap();
        assert_eq!(e.prepare_resume().unwrap().as_deref(), Some("up-1"));
    }

    #[test]
    fn interrupted_finalization_restores_as_error() {
        let plan = ChunkPlan::new(100, 25).unwrap();
        let mut e = TaskEntry::restore(
            record(UploadStatus::Processing, vec![0, 1, 2, 3]),
            plan,
            3,
        );
        assert_eq!(e.task.status, UploadStatus::Error);
        assert_eq!(e.task.error, Some(TaskError::Interrupted));
        // Covered tasks finalize without a byte source.
        assert!(matches!(e.start_run().unwrap(), StartOutcome::Finalize(_)));
    }

    #[test]
    fn resume_info_replaces_local_state() {
        let plan = ChunkPlan::new(100, 25).unwrap();
        let mut e = TaskEntry::restore(record(UploadStatus::Paused, vec![0, 1]), plan, 3);
        e.apply_resume_info(ResumeInfoResponse {
            chunks_received: vec![0],
            total_chunks: 4,
        });
        assert_eq!(e.task.chunks_uploaded, BTreeSet::from([0]));
        assert_eq!(e.task.progress, 25);
        assert!(!e.needs_reconcile);
    }

    #[test]
    fn resume_info_with_other_plan_resets() {
        let plan = ChunkPlan::new(100, 25).unwrap();
        let mut e = TaskEntry::restore(record(UploadStatus::Paused, vec![0, 1]), plan, 3);
        e.apply_resume_info(ResumeInfoResponse {
            chunks_received: vec![0, 1],
            total_chunks: 7,
        });
        assert!(e.task.chunks_uploaded.is_empty());
        assert_eq!(e.task.upload_id, None);
    }

    #[test]
    fn record_without_chunk_size_starts_over() {
        let plan = ChunkPlan::new(100, 25).unwrap();
        let mut old = record(UploadStatus::Paused, vec![0, 1]);
        old.chunk_size = None;
        let e = TaskEntry::restore(old, plan, 3);
        assert!(e.task.chunks_uploaded.is_empty());
        assert_eq!(e.task.upload_id, None);
        assert_eq!(e.task.progress, 0);
        assert!(!e.needs_reconcile);
    }

    #[test]
    fn record_excludes_source_state() {
        let e = entry(100, 25);
        let record = e.task.to_record();
        assert_eq!(record.file_id, "f1");
        assert_eq!(record.status, UploadStatus::Queued);
        assert_eq!(record.chunk_size, Some(25));
        assert!(record.chunks_uploaded.is_empty());
    }

    #[test]
    fn all_chunks_uploaded_checks_every_index() {
        let mut e = entry(100, 25);
        e.task.chunks_uploaded = BTreeSet::from([0, 1, 2]);
        assert!(!e.task.all_chunks_uploaded());
        e.task.chunks_uploaded.insert(3);
        assert!(e.task.all_chunks_uploaded());
    }
}
