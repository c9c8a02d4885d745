use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

use crate::errors::{Result, WalError};

const WAL_DIR: &str = "wal";
const SNAP_DIR: &str = "snap";
const BACKEND_FILE: &str = "store.db";
const WRITE_PROBE: &str = ".touch";

/// Explicit configuration handed into every repair procedure. The data
/// directory layout is fixed: `wal/` for segments, `snap/` for snapshot
/// files, `store.db` for the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RepairConfig {
    pub data_dir: PathBuf,
}

impl RepairConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> RepairConfig {
        RepairConfig {
            data_dir: data_dir.into(),
        }
    }

    pub fn from_toml(path: &Path) -> Result<RepairConfig> {
        let contents = std::fs::read_to_string(path)?;
        let config: RepairConfig = toml::from_str(&contents)
            .map_err(|e| WalError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(WAL_DIR)
    }

    pub fn snap_dir(&self) -> PathBuf {
        self.data_dir.join(SNAP_DIR)
    }

    pub fn backend_path(&self) -> PathBuf {
        self.data_dir.join(BACKEND_FILE)
    }

    /// Fail fast when the wal directory is missing or not writable. A
    /// directory still held by a live server, or mounted read-only,
    /// must abort the repair before any file is opened.
    pub fn ensure_writable(&self) -> Result<()> {
        let probe = self.wal_dir().join(WRITE_PROBE);
        std::fs::write(&probe, b"")
            .map_err(|e| WalError::Config(format!("cannot write to wal directory: {}", e)))?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }
}
