//! Durable storage for resumable upload records.
//!
//! Records live under `<config dir>/<namespace>/uploads/`, one
//! `<file_id>.json` per upload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chunkup_protocol::PersistedUploadRecord;

/// Errors from record storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config directory not available")]
    NoConfigDir,

    #[error("invalid record key: {0}")]
    InvalidKey(String),
}

/// Keyed storage of [`PersistedUploadRecord`]s.
///
/// Methods are blocking; the engine calls them from a background writer.
pub trait RecordStore: Send + Sync {
    /// Returns every stored record.
    fn load_all(&self) -> Result<Vec<PersistedUploadRecord>, StoreError>;

    /// Inserts or replaces the record for `record.file_id`.
    fn save(&self, record: &PersistedUploadRecord) -> Result<(), StoreError>;

    /// Deletes the record for `file_id`. Missing records are not an error.
    fn remove(&self, file_id: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// JsonDirStore
// ---------------------------------------------------------------------------

/// One JSON file per record in a directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Opens (and creates) the store directory at `dir`.
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Opens the store for `namespace` under the platform config dir.
    pub fn in_namespace(namespace: &str) -> Result<Self, StoreError> {
        let base = crate::config::config_base_dir().ok_or(StoreError::NoConfigDir)?;
        Self::new(&base.join(namespace).join("uploads"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, file_id: &str) -> Result<PathBuf, StoreError> {
        validate_key(file_id)?;
        Ok(self.dir.join(format!("{file_id}.json")))
    }
}

impl RecordStore for JsonDirStore {
    fn load_all(&self) -> Result<Vec<PersistedUploadRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|data| Ok(serde_json::from_slice::<PersistedUploadRecord>(&data)?));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable upload record");
                }
            }
        }
        records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(records)
    }

    fn save(&self, record: &PersistedUploadRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.file_id)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<(), StoreError> {
        let path = self.record_path(file_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn validate_key(file_id: &str) -> Result<(), StoreError> {
    let valid = !file_id.is_empty()
        && file_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(file_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-process store, for tests and embedders without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, PersistedUploadRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `file_id`, if stored.
    pub fn get(&self, file_id: &str) -> Option<PersistedUploadRecord> {
        self.lock().get(file_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, PersistedUploadRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<PersistedUploadRecord>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn save(&self, record: &PersistedUploadRecord) -> Result<(), StoreError> {
        self.lock().insert(record.file_id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<(), StoreError> {
        self.lock().remove(file_id);
        Ok(())
    }
}
