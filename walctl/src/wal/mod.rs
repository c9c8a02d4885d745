//! The write-ahead log: record codec, segment reader/writer, and the
//! log-level scans replay is built on.

pub mod decoder;
pub mod encoder;
pub mod record;

use std::path::Path;

use protobuf::Message;
use raft_proto::eraftpb::{Entry, HardState};

use crate::errors::{Result, WalError};
use crate::wal::decoder::{list_segments, SegmentRef, WalReader};
use crate::wal::record::{RecordKind, SnapshotMark, WalMetadata};

fn corrupt_at(reader: &WalReader, reason: String) -> WalError {
    WalError::CorruptRecord {
        location: format!("{}@{}", reader.segment_name(), reader.last_frame_offset()),
        reason,
    }
}

/// Scan the whole log, with the full checksum discipline, purely to
/// extract snapshot marks. Entry payloads are not decoded. Only marks at
/// or below the last recorded commit index are trusted: a mark past the
/// commit may describe a snapshot cut that never became durable.
pub fn valid_snapshot_marks(wal_dir: &Path) -> Result<Vec<SnapshotMark>> {
    let mut reader = WalReader::open(list_segments(wal_dir)?)?;
    let mut marks: Vec<SnapshotMark> = Vec::new();
    let mut state = HardState::default();

    while let Some(rec) = reader.next_record()? {
        match rec.kind {
            RecordKind::SnapshotMark => {
                let mark = SnapshotMark::decode(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                marks.push(mark);
            }
            RecordKind::State => {
                let mut parsed = HardState::default();
                parsed
                    .merge_from_bytes(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                state = parsed;
            }
            _ => {}
        }
    }

    marks.retain(|m| m.index <= state.commit);
    Ok(marks)
}

/// Everything a single read of the log yields.
#[derive(Debug)]
pub struct LogReplay {
    pub metadata: Option<WalMetadata>,
    pub hard_state: HardState,
    pub entries: Vec<Entry>,
}

/// Select the segments a replay starting at `index` has to read: from
/// the newest segment whose first entry index is at or below `index`.
fn segments_from(segments: Vec<SegmentRef>, index: u64) -> Vec<SegmentRef> {
    let mut start = 0;
    for (i, segment) in segments.iter().enumerate() {
        if segment.first_index <= index {
            start = i;
        } else {
            break;
        }
    }
    segments[start..].to_vec()
}

/// Read the log from the position implied by `start` (the newest durable
/// snapshot, or the zero mark when there is none) to the end.
///
/// Entries below or at the snapshot index are skipped; an entry rewrites
/// any previously collected entries at or above its index (a leader
/// change may have overwritten the tail). The latest state record wins
/// outright. When the read starts from a snapshot, a mark equal to it
/// must appear in the stream, otherwise log and snapshot disagree about
/// history and replay must not proceed.
pub fn read_log(wal_dir: &Path, start: SnapshotMark) -> Result<LogReplay> {
    let segments = segments_from(list_segments(wal_dir)?, start.index);
    let mut reader = WalReader::open(segments)?;

    let mut metadata: Option<WalMetadata> = None;
    let mut hard_state = HardState::default();
    let mut entries: Vec<Entry> = Vec::new();
    let mut mark_seen = start.index == 0 && start.term == 0;

    while let Some(rec) = reader.next_record()? {
        match rec.kind {
            RecordKind::Entry => {
                let mut entry = Entry::default();
                entry
                    .merge_from_bytes(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                if entry.index > start.index {
                    while entries.last().map_or(false, |last| last.index >= entry.index) {
                        entries.pop();
                    }
                    entries.push(entry);
                }
            }
            RecordKind::State => {
                let mut parsed = HardState::default();
                parsed
                    .merge_from_bytes(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                hard_state = parsed;
            }
            RecordKind::SnapshotMark => {
                let mark = SnapshotMark::decode(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                if mark == start {
                    mark_seen = true;
                }
            }
            RecordKind::Metadata => {
                let parsed = WalMetadata::decode(&rec.payload)
                    .map_err(|e| corrupt_at(&reader, e.to_string()))?;
                if let Some(previous) = metadata {
                    if previous != parsed {
                        return Err(WalError::MetadataConflict);
                    }
                }
                metadata = Some(parsed);
            }
            RecordKind::Crc => {}
        }
    }

    if !mark_seen {
        return Err(WalError::SnapshotMismatch {
            index: start.index,
            term: start.term,
        });
    }

    log::info!(
        "wal read complete: {} entries after index {}, commit index {}",
        entries.len(),
        start.index,
        hard_state.commit
    );

    Ok(LogReplay {
        metadata,
        hard_state,
        entries,
    })
}
