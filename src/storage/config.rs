//! Storage configuration types and utilities

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// File-based storage (default)
    #[default]
    File,
    /// Memory storage (for testing)
    Memory,
}

/// Main storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend type
    #[serde(default)]
    pub backend: BackendType,

    /// Base directory for the file backend
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Maximum number of concurrently open metadata sessions
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,

    /// How long a stage waits for a metadata session
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_base_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".churnwise"))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(".churnwise"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            base_dir: default_base_dir(),
            connection_pool_size: default_pool_size(),
            timeout: default_timeout(),
        }
    }
}

impl StorageConfig {
    /// In-memory configuration, used by tests and embedded callers
    pub fn memory() -> Self {
        Self {
            backend: BackendType::Memory,
            ..Self::default()
        }
    }

    /// File configuration rooted at `base_dir`
    pub fn file(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendType::File,
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Apply `CHURNWISE_STORAGE_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(kind) = std::env::var("CHURNWISE_STORAGE_TYPE") {
            match kind.to_lowercase().as_str() {
                "file" => self.backend = BackendType::File,
                "memory" => self.backend = BackendType::Memory,
                _ => {}
            }
        }
        if let Ok(dir) = std::env::var("CHURNWISE_STORAGE_DIR") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(size) = std::env::var("CHURNWISE_STORAGE_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.connection_pool_size = size;
        }
    }
}
