//! Persists and loads point-in-time checkpoints.
//!
//! A snapshot file is only trusted if the wal itself recorded the
//! matching snapshot cut: the file system alone cannot tell a durable
//! checkpoint from one whose cut never committed.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use protobuf::Message;
use raft_proto::eraftpb::Snapshot;

use crate::errors::{Result, WalError};
use crate::wal::record::SnapshotMark;

const SNAP_SUFFIX: &str = ".snap";
const BROKEN_SUFFIX: &str = ".broken";
const TMP_SUFFIX: &str = ".tmp";

fn snap_file_name(term: u64, index: u64) -> String {
    format!("{:016x}-{:016x}{}", term, index, SNAP_SUFFIX)
}

pub struct SnapStore {
    dir: PathBuf,
}

impl SnapStore {
    pub fn new(dir: impl Into<PathBuf>) -> SnapStore {
        SnapStore { dir: dir.into() }
    }

    /// Durably write a snapshot. The temp-file + fsync + rename sequence
    /// guarantees a reader never observes a partial file; on any failure
    /// the previous state of the directory is intact.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let metadata = snapshot.get_metadata();
        let name = snap_file_name(metadata.term, metadata.index);
        let body = snapshot
            .write_to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut data = Vec::with_capacity(4 + body.len());
        data.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        data.extend_from_slice(&body);

        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{}{}", name, TMP_SUFFIX));
        let result = self.write_atomic(&tmp, &path, &data);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        } else {
            log::info!("saved snapshot {}", name);
        }
        result
    }

    fn write_atomic(&self, tmp: &PathBuf, path: &PathBuf, data: &[u8]) -> Result<()> {
        let mut file = File::create(tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, path)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// The newest snapshot whose (index, term) the wal vouches for.
    ///
    /// Candidates are tried newest to oldest. A file that fails its own
    /// integrity check is quarantined and skipped; a readable file whose
    /// position has no wal mark is skipped as untrusted. An empty store
    /// is the ordinary bootstrap condition (`NoSnapshot`); a store with
    /// candidates but no acceptable one is an inconsistency the caller
    /// must treat as fatal (`NoValidSnapshot`).
    pub fn load_newest_available(&self, marks: &[SnapshotMark]) -> Result<Snapshot> {
        let names = self.snap_names()?;
        if names.is_empty() {
            return Err(WalError::NoSnapshot);
        }

        for name in names {
            let snapshot = match self.load_file(&name) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("quarantining unreadable snapshot {}: {}", name, e);
                    self.quarantine(&name);
                    continue;
                }
            };
            let metadata = snapshot.get_metadata();
            let mark = SnapshotMark {
                index: metadata.index,
                term: metadata.term,
            };
            if marks.contains(&mark) {
                log::info!(
                    "loaded snapshot {} (index {}, term {})",
                    name,
                    mark.index,
                    mark.term
                );
                return Ok(snapshot);
            }
            log::warn!(
                "snapshot {} has no matching wal mark, skipping",
                name
            );
        }

        Err(WalError::NoValidSnapshot)
    }

    /// Snapshot file names, newest first. The zero-padded term-index
    /// naming makes lexical order match snapshot order.
    fn snap_names(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(SNAP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        names.reverse();
        Ok(names)
    }

    fn load_file(&self, name: &str) -> io::Result<Snapshot> {
        let data = fs::read(self.dir.join(name))?;
        if data.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot file shorter than its checksum",
            ));
        }
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&data[..4]);
        let stored = u32::from_le_bytes(stored);
        let body = &data[4..];
        if crc32fast::hash(body) != stored {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot body does not match its checksum",
            ));
        }
        let mut snapshot = Snapshot::default();
        snapshot
            .merge_from_bytes(body)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(snapshot)
    }

    fn quarantine(&self, name: &str) {
        let from = self.dir.join(name);
        let to = self.dir.join(format!("{}{}", name, BROKEN_SUFFIX));
        if let Err(e) = fs::rename(&from, &to) {
            log::error!("failed to quarantine snapshot {}: {}", name, e);
        }
    }
}
