//! Owner of every task entry.
//!
//! All mutation goes through [`TaskRegistry::update`], which applies a
//! closure under the lock and then publishes the resulting snapshot:
//! broadcast to subscribers and queued for persistence, in that order and
//! before the lock is released, so observers and the store see updates for
//! one task in the order they happened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chunkup_protocol::UploadStatus;
use tokio::sync::broadcast;

use crate::error::{EngineError, TaskError};
use crate::persist::Persister;
use crate::task::{TaskEntry, UploadTask};

/// Capacity of the event channel. Slow subscribers see `Lagged` and should
/// re-read snapshots.
const EVENT_CAPACITY: usize = 256;

/// Callback invoked when a task enters the `error` state.
pub type ErrorCallback = Box<dyn Fn(&str, &TaskError) + Send + Sync>;

/// Change notification for one task.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Updated(UploadTask),
    Removed { file_id: String },
}

impl RegistryEvent {
    pub fn file_id(&self) -> &str {
        match self {
            RegistryEvent::Updated(task) => &task.file_id,
            RegistryEvent::Removed { file_id } => file_id,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, TaskEntry>,
    /// Insertion order, for stable listings.
    order: Vec<String>,
}

pub(crate) struct TaskRegistry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
    persister: Option<Persister>,
    on_error: Mutex<Vec<Arc<ErrorCallback>>>,
}

impl TaskRegistry {
    pub fn new(persister: Option<Persister>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            persister,
            on_error: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn persister(&self) -> Option<&Persister> {
        self.persister.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn add_error_callback(&self, cb: ErrorCallback) {
        self.on_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(cb));
    }

    /// Broadcasts and persists `task`. Called with the lock held.
    fn publish(&self, task: &UploadTask) {
        if let Some(persister) = &self.persister {
            if task.status == UploadStatus::Complete {
                persister.remove(&task.file_id);
            } else {
                persister.save(task.to_record());
            }
        }
        // No receivers is fine.
        let _ = self.events.send(RegistryEvent::Updated(task.clone()));
    }

    /// Adds an entry. Replaces any entry with the same id.
    pub fn insert(&self, entry: TaskEntry) {
        let mut inner = self.lock();
        let file_id = entry.task.file_id.clone();
        self.publish(&entry.task);
        if inner.entries.insert(file_id.clone(), entry).is_none() {
            inner.order.push(file_id);
        }
    }

    /// Applies `f` to the entry for `file_id` and publishes any change.
    pub fn update<R>(
        &self,
        file_id: &str,
        f: impl FnOnce(&mut TaskEntry) -> R,
    ) -> Result<R, EngineError> {
        let (result, entered_error) = {
            let mut inner = self.lock();
            let entry = inner
                .entries
                .get_mut(file_id)
                .ok_or_else(|| EngineError::NotFound(file_id.to_string()))?;

            let before = entry.task.clone();
            let result = f(&mut *entry);
            let after = &entry.task;

            let mut entered_error = None;
            if *after != before {
                self.publish(after);
                if after.status == UploadStatus::Error && before.status != UploadStatus::Error {
                    entered_error = after.error.clone();
                }
            }
            (result, entered_error)
        };

        if let Some(error) = entered_error {
            self.notify_error(file_id, &error);
        }
        Ok(result)
    }

    fn notify_error(&self, file_id: &str, error: &TaskError) {
        let callbacks: Vec<Arc<ErrorCallback>> = self
            .on_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in callbacks {
            cb(file_id, error);
        }
    }

    /// Reads the entry for `file_id` without publishing.
    pub fn read<R>(&self, file_id: &str, f: impl FnOnce(&TaskEntry) -> R) -> Result<R, EngineError> {
        let inner = self.lock();
        let entry = inner
            .entries
            .get(file_id)
            .ok_or_else(|| EngineError::NotFound(file_id.to_string()))?;
        Ok(f(entry))
    }

    pub fn get(&self, file_id: &str) -> Option<UploadTask> {
        self.lock().entries.get(file_id).map(|e| e.task.clone())
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.lock().entries.contains_key(file_id)
    }

    /// Snapshots of every task, in insertion order.
    pub fn snapshots(&self) -> Vec<UploadTask> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Removes the entry for `file_id` if `check` allows it.
    ///
    /// The entry's in-flight work is aborted and its persisted record deleted.
    pub fn remove_if(
        &self,
        file_id: &str,
        check: impl FnOnce(&TaskEntry) -> Result<(), EngineError>,
    ) -> Result<UploadTask, EngineError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get(file_id)
            .ok_or_else(|| EngineError::NotFound(file_id.to_string()))?;
        check(entry)?;
        let entry = inner
            .entries
            .remove(file_id)
            .ok_or_else(|| EngineError::NotFound(file_id.to_string()))?;
        inner.order.retain(|id| id != file_id);
        Ok(self.discard(entry))
    }

    /// Removes every entry in a terminal state. Returns the removed ids.
    pub fn remove_terminal(&self) -> Vec<String> {
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.task.status.is_terminal())
            })
            .cloned()
            .collect();
        for id in &ids {
            if let Some(entry) = inner.entries.remove(id) {
                self.discard(entry);
            }
        }
        inner.order.retain(|id| !ids.contains(id));
        ids
    }

    /// Tears down a removed entry. Called with the lock held.
    fn discard(&self, mut entry: TaskEntry) -> UploadTask {
        entry.abort_all();
        if let Some(persister) = &self.persister {
            persister.remove(&entry.task.file_id);
        }
        let _ = self.events.send(RegistryEvent::Removed {
            file_id: entry.task.file_id.clone(),
        });
        entry.task
    }
}
