//! Engine configuration.
//!
//! Stored as JSON at `<config dir>/chunkup/config.json`. Every field has a
//! default, so a partial or missing file still yields a usable config.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Default number of chunk transfers in flight per file.
pub const DEFAULT_CONCURRENT_UPLOADS: usize = 3;

/// Default upper bound on accepted file size: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default storage namespace for persisted upload records.
pub const DEFAULT_NAMESPACE: &str = "chunkup";

/// Tunables for chunking, concurrency, validation and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per chunk.
    pub chunk_size: u64,
    /// Maximum chunk transfers in flight for a single file.
    pub concurrent_uploads: usize,
    /// Largest accepted file, in bytes.
    pub max_file_size: u64,
    /// Accepted MIME types; empty accepts everything.
    pub allowed_file_types: HashSet<String>,
    /// Directory name under the config dir holding upload records.
    pub storage_namespace: String,
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: chunkup_transfer::DEFAULT_CHUNK_SIZE,
            concurrent_uploads: DEFAULT_CONCURRENT_UPLOADS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_file_types: HashSet::new(),
            storage_namespace: DEFAULT_NAMESPACE.into(),
            server: ServerConfig::default(),
        }
    }
}

/// Upload server location and endpoint paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub chunk_path: String,
    pub complete_path: String,
    pub resume_path: String,
    /// Per-request timeout. `None` leaves requests unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/upload".into(),
            chunk_path: "/chunk".into(),
            complete_path: "/complete".into(),
            resume_path: "/resume".into(),
            timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Loads the config from the default location, falling back to defaults.
    pub fn load() -> Result<Self, EngineError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads the config from `path`.
    ///
    /// A missing file yields defaults; an unparseable one is logged and
    /// also yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<EngineConfig>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse engine config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Writes the config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "engine config saved");
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be greater than zero".into()));
        }
        if self.concurrent_uploads == 0 {
            return Err(EngineError::Config(
                "concurrent_uploads must be greater than zero".into(),
            ));
        }
        if self.max_file_size.div_ceil(self.chunk_size) > u64::from(u32::MAX) {
            return Err(EngineError::Config(format!(
                "max_file_size {} needs more than {} chunks of {} bytes",
                self.max_file_size,
                u32::MAX,
                self.chunk_size
            )));
        }
        if self.storage_namespace.is_empty()
            || self.storage_namespace.contains(['/', '\\'])
            || self.storage_namespace == ".."
        {
            return Err(EngineError::Config(format!(
                "invalid storage namespace {:?}",
                self.storage_namespace
            )));
        }
        Ok(())
    }
}

/// Default config file location: `<config dir>/chunkup/config.json`.
pub fn config_path() -> Option<PathBuf> {
    config_base_dir().map(|d| d.join(DEFAULT_NAMESPACE).join("config.json"))
}

/// Platform configuration base directory.
pub fn config_base_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.concurrent_uploads, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"chunk_size": 1024, "server": {"base_url": "http://h"}}"#)
            .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.concurrent_uploads, DEFAULT_CONCURRENT_UPLOADS);
        assert_eq!(config.server.base_url, "http://h");
        assert_eq!(config.server.chunk_path, "/chunk");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn garbage_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), EngineConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = EngineConfig::default();
        config.allowed_file_types.insert("image/*".into());
        config.server.timeout_secs = Some(30);
        config.save_to(&path).unwrap();

        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = EngineConfig {
            concurrent_uploads: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_namespace_with_separator() {
        let config = EngineConfig {
            storage_namespace: "../etc".into(),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
