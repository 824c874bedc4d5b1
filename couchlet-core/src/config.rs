//! Database configuration
//!
//! Stored as JSON, e.g.
//!
//! ```json
//! {
//!   "name": "notes",
//!   "storage": { "type": "sqlite", "path": "data/notes.sqlite" },
//!   "max_history_depth": 1000
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::rev_tree::DEFAULT_MAX_HISTORY_DEPTH;
use crate::storage::{Result, StorageError};

/// Where a database keeps its tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

/// Configuration of one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name used for change notifications and `info()`
    pub name: String,
    pub storage: StorageConfig,
    /// Generations of history kept behind every leaf
    #[serde(default = "default_max_history_depth")]
    pub max_history_depth: usize,
    /// SQLite page cache size in KiB
    #[serde(default = "default_cache_size")]
    pub sqlite_cache_size_kib: u32,
}

fn default_max_history_depth() -> usize {
    DEFAULT_MAX_HISTORY_DEPTH
}

fn default_cache_size() -> u32 {
    64_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            storage: StorageConfig::Memory,
            max_history_depth: default_max_history_depth(),
            sqlite_cache_size_kib: default_cache_size(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory database called `name`
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// SQLite database at `path`, named after the file stem
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        Self {
            name,
            storage: StorageConfig::Sqlite { path },
            ..Default::default()
        }
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| StorageError::Backend(format!("Failed to read config {:?}: {}", path, e)))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save a config file through a temporary file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
