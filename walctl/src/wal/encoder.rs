use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use protobuf::Message;
use raft_proto::eraftpb::{Entry, HardState};

use crate::errors::Result;
use crate::wal::decoder::segment_file_name;
use crate::wal::record::{fold_crc, Record, RecordKind, SnapshotMark, WalMetadata};

/// Append side of one segment file.
///
/// Every new segment starts with a crc record carrying the running
/// checksum of the stream so far, so a reader that opens the log at this
/// segment can seed its accumulator without replaying older files.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    crc: u32,
}

impl SegmentWriter {
    pub fn create(dir: &Path, seq: u64, first_index: u64, prev_crc: u32) -> Result<SegmentWriter> {
        let path = dir.join(segment_file_name(seq, first_index));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = SegmentWriter {
            file,
            path,
            crc: prev_crc,
        };
        writer.append_record(&Record::crc_record(prev_crc))?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The running checksum after everything appended so far; seed for
    /// the next segment's `create`.
    pub fn running_crc(&self) -> u32 {
        self.crc
    }

    pub fn append_entry(&mut self, entry: &Entry) -> Result<()> {
        let payload = entry
            .write_to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.append_payload(RecordKind::Entry, payload)
    }

    pub fn append_state(&mut self, state: &HardState) -> Result<()> {
        let payload = state
            .write_to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.append_payload(RecordKind::State, payload)
    }

    pub fn append_snapshot_mark(&mut self, mark: &SnapshotMark) -> Result<()> {
        let payload = mark.encode()?;
        self.append_payload(RecordKind::SnapshotMark, payload)
    }

    pub fn append_metadata(&mut self, metadata: &WalMetadata) -> Result<()> {
        let payload = metadata.encode()?;
        self.append_payload(RecordKind::Metadata, payload)
    }

    /// Emit a fresh attestation of the running checksum, e.g. right after
    /// a snapshot cut.
    pub fn append_crc_boundary(&mut self) -> Result<()> {
        self.append_record(&Record::crc_record(self.crc))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn append_payload(&mut self, kind: RecordKind, payload: Vec<u8>) -> Result<()> {
        self.crc = fold_crc(self.crc, &payload);
        let record = Record::new(kind, self.crc, payload);
        self.append_record(&record)
    }

    fn append_record(&mut self, record: &Record) -> Result<()> {
        self.file.write_all(&record.encode())?;
        Ok(())
    }
}
