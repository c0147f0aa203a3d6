//! In-memory [`UploadServer`] for engine tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chunkup_protocol::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
    ResumeInfoResponse,
};
use tokio::sync::Notify;

use crate::server::{ServerError, ServerFuture, UploadServer};

#[derive(Default)]
struct MockState {
    chunk_calls: Vec<ChunkUploadRequest>,
    /// Payload bytes of every accepted chunk.
    bytes_received: u64,
    complete_calls: Vec<CompleteUploadRequest>,
    /// upload_id -> (total_chunks, received indices)
    sessions: HashMap<String, (u32, BTreeSet<u32>)>,
    held: HashSet<u32>,
    failing: HashSet<u32>,
    complete_failures: usize,
    resume_info_broken: bool,
    delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct MockServer {
    state: Mutex<MockState>,
    active: AtomicUsize,
    peak: AtomicUsize,
    next_id: AtomicUsize,
    released: Notify,
}

/// Tracks one in-flight chunk request.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Chunk requests for `index` block until [`release`](Self::release).
    pub fn hold(&self, index: u32) {
        self.lock().held.insert(index);
    }

    pub fn release(&self, index: u32) {
        self.lock().held.remove(&index);
        self.released.notify_waiters();
    }

    pub fn fail_chunk(&self, index: u32) {
        self.lock().failing.insert(index);
    }

    pub fn unfail_chunk(&self, index: u32) {
        self.lock().failing.remove(&index);
    }

    /// The next `n` completion calls fail.
    pub fn fail_completions(&self, n: usize) {
        self.lock().complete_failures = n;
    }

    pub fn break_resume_info(&self) {
        self.lock().resume_info_broken = true;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Pretends an earlier process already uploaded `chunks` into `upload_id`.
    pub fn seed_session(&self, upload_id: &str, total: u32, chunks: &[u32]) {
        self.lock().sessions.insert(
            upload_id.to_string(),
            (total, chunks.iter().copied().collect()),
        );
    }

    pub fn chunk_calls(&self) -> Vec<ChunkUploadRequest> {
        self.lock().chunk_calls.clone()
    }

    /// Indices of every chunk request, sorted.
    pub fn chunk_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.lock().chunk_calls.iter().map(|c| c.chunk_index).collect();
        indices.sort_unstable();
        indices
    }

    pub fn bytes_received(&self) -> u64 {
        self.lock().bytes_received
    }

    pub fn complete_calls(&self) -> Vec<CompleteUploadRequest> {
        self.lock().complete_calls.clone()
    }

    /// Resolves once at least `n` chunk requests have arrived.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let arrived = self.lock().chunk_calls.len();
                if arrived >= n {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("chunk requests never arrived");
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(&self.active)
    }

    async fn handle_chunk(
        &self,
        request: ChunkUploadRequest,
        data: Vec<u8>,
    ) -> Result<ChunkUploadResponse, ServerError> {
        let _active = self.enter();
        let index = request.chunk_index;
        let delay = {
            let mut state = self.lock();
            state.chunk_calls.push(request.clone());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        loop {
            let notified = self.released.notified();
            let held = self.lock().held.contains(&index);
            if !held {
                break;
            }
            notified.await;
        }

        if self.lock().failing.contains(&index) {
            return Err(ServerError::Api {
                status: 500,
                body: format!("chunk {index} rejected"),
            });
        }
        assert!(!data.is_empty(), "chunk {index} carried no bytes");

        let upload_id = match request.upload_id {
            Some(id) => id,
            None => format!("up-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        };
        let mut state = self.lock();
        state.bytes_received += data.len() as u64;
        state
            .sessions
            .entry(upload_id.clone())
            .or_insert_with(|| (request.total_chunks, BTreeSet::new()))
            .1
            .insert(index);
        drop(state);

        Ok(ChunkUploadResponse {
            upload_id,
            chunk_index: index,
            received: true,
        })
    }

    async fn handle_complete(
        &self,
        request: CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, ServerError> {
        let mut state = self.lock();
        state.complete_calls.push(request.clone());
        if state.complete_failures > 0 {
            state.complete_failures -= 1;
            return Err(ServerError::Api {
                status: 503,
                body: "assembly unavailable".into(),
            });
        }
        Ok(CompleteUploadResponse {
            file_id: format!("srv-{}", request.upload_id),
            file_url: format!("/files/{}", request.upload_id),
            file_name: Some(request.file_name),
            file_type: None,
            file_size: None,
        })
    }

    async fn handle_resume_info(&self, upload_id: String) -> Result<ResumeInfoResponse, ServerError> {
        let state = self.lock();
        if state.resume_info_broken {
            return Err(ServerError::Other("resume-info unavailable".into()));
        }
        match state.sessions.get(&upload_id) {
            Some((total, chunks)) => Ok(ResumeInfoResponse {
                chunks_received: chunks.iter().copied().collect(),
                total_chunks: *total,
            }),
            None => Err(ServerError::UnknownUpload(upload_id)),
        }
    }
}

impl UploadServer for MockServer {
    fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        data: Vec<u8>,
    ) -> ServerFuture<'_, ChunkUploadResponse> {
        Box::pin(self.handle_chunk(request, data))
    }

    fn complete(&self, request: CompleteUploadRequest) -> ServerFuture<'_, CompleteUploadResponse> {
        Box::pin(self.handle_complete(request))
    }

    fn resume_info(&self, upload_id: String) -> ServerFuture<'_, ResumeInfoResponse> {
        Box::pin(self.handle_resume_info(upload_id))
    }
}
