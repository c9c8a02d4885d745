//! Reads an ordered list of segment files as one logically continuous,
//! checksum-verified record stream.
//!
//! The checksum is cumulative across the whole replay session: every
//! non-crc payload is folded into a running value, and a crc record
//! attests to everything consumed since the previous one. Replay is
//! therefore strictly sequential; there is no random access into the
//! middle of the stream.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::errors::{Result, WalError};
use crate::wal::record::{self, Record, RecordKind, FRAME_HEADER_SIZE};

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";

/// One on-disk segment of the logical record stream, identified by its
/// file sequence number and the raft index of its first entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    pub path: PathBuf,
    pub seq: u64,
    pub first_index: u64,
}

pub fn segment_file_name(seq: u64, first_index: u64) -> String {
    format!("{}{:016x}_{:016x}{}", SEGMENT_PREFIX, seq, first_index, SEGMENT_SUFFIX)
}

pub fn parse_segment_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    let (seq, index) = rest.split_once('_')?;
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Enumerate the segment files of a log directory, oldest first. The
/// participating files must form an unbroken sequence.
pub fn list_segments(dir: &Path) -> Result<Vec<SegmentRef>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.ends_with(SEGMENT_SUFFIX) {
            continue;
        }
        match parse_segment_name(&name) {
            Some((seq, first_index)) => segments.push(SegmentRef {
                path: entry.path(),
                seq,
                first_index,
            }),
            None => log::warn!("ignoring unrecognized file {} in wal directory", name),
        }
    }
    segments.sort_by_key(|s| s.seq);
    for pair in segments.windows(2) {
        if pair[1].seq != pair[0].seq + 1 {
            return Err(WalError::BadSegmentSequence(
                pair[1].path.display().to_string(),
            ));
        }
    }
    Ok(segments)
}

enum Fill {
    Full,
    Eof,
    Short,
}

fn read_fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if filled == buf.len() {
        Ok(Fill::Full)
    } else if filled == 0 {
        Ok(Fill::Eof)
    } else {
        Ok(Fill::Short)
    }
}

/// Sequential reader over a list of segments. Segment boundaries carry no
/// record-level semantics: exhausting one file transparently advances to
/// the next, and end-of-stream is reported only after the last one.
pub struct WalReader {
    segments: Vec<SegmentRef>,
    current: usize,
    reader: Option<BufReader<File>>,
    offset: u64,
    frame_offset: u64,
    crc: u32,
}

impl WalReader {
    pub fn open(segments: Vec<SegmentRef>) -> Result<WalReader> {
        let mut reader = WalReader {
            segments,
            current: 0,
            reader: None,
            offset: 0,
            frame_offset: 0,
            crc: 0,
        };
        reader.open_current()?;
        Ok(reader)
    }

    /// The running checksum accumulated so far in this session.
    pub fn current_crc(&self) -> u32 {
        self.crc
    }

    /// Name of the segment the reader is positioned in.
    pub fn segment_name(&self) -> String {
        match self.segments.get(self.current.min(self.segments.len().saturating_sub(1))) {
            Some(segment) => segment
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| segment.path.display().to_string()),
            None => "<empty>".to_string(),
        }
    }

    /// Byte offset of the most recently returned frame within its segment.
    pub fn last_frame_offset(&self) -> u64 {
        self.frame_offset
    }

    fn open_current(&mut self) -> Result<()> {
        if self.current < self.segments.len() {
            let file = File::open(&self.segments[self.current].path)?;
            log::debug!("reading wal segment {}", self.segment_name());
            self.reader = Some(BufReader::new(file));
            self.offset = 0;
        } else {
            self.reader = None;
        }
        Ok(())
    }

    fn advance_segment(&mut self) -> Result<()> {
        self.current += 1;
        self.open_current()
    }

    fn at_last_segment(&self) -> bool {
        self.current + 1 >= self.segments.len()
    }

    /// The next record with the checksum discipline applied. Crc records
    /// are validated and consumed here, never handed to the caller.
    /// `Ok(None)` means the final segment is exhausted.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let rec = match self.next_frame()? {
                Some(rec) => rec,
                None => return Ok(None),
            };

            if rec.kind == RecordKind::Crc {
                let stored = match rec.crc_value() {
                    Some(stored) => stored,
                    None => {
                        return Err(WalError::CorruptRecord {
                            location: format!("{}@{}", self.segment_name(), self.frame_offset),
                            reason: "crc record payload is not a 32-bit value".to_string(),
                        })
                    }
                };
                // A zero accumulator means this is the first record of the
                // session: the stored value establishes the baseline
                // instead of being checked against it.
                if self.crc != 0 && self.crc != stored {
                    return Err(WalError::CrcMismatch {
                        segment: self.segment_name(),
                        offset: self.frame_offset,
                        stored,
                        running: self.crc,
                    });
                }
                self.update_crc(stored);
                continue;
            }

            self.crc = record::fold_crc(self.crc, &rec.payload);
            return Ok(Some(rec));
        }
    }

    /// Reset the accumulator to an attested value, either the session
    /// baseline or a fresh checksum boundary.
    fn update_crc(&mut self, value: u32) {
        self.crc = value;
    }

    fn torn_or_truncated(&mut self) -> Result<Option<Record>> {
        if self.at_last_segment() {
            // A partial frame at the tail of the final segment is a torn
            // write from a crash; everything before it is intact.
            log::warn!(
                "torn record frame at tail of {} (offset {}), ending replay",
                self.segment_name(),
                self.frame_offset
            );
            self.reader = None;
            self.current = self.segments.len();
            return Ok(None);
        }
        Err(WalError::TruncatedFrame {
            segment: self.segment_name(),
            offset: self.frame_offset,
        })
    }

    /// The next raw frame, advancing across segment boundaries.
    fn next_frame(&mut self) -> Result<Option<Record>> {
        loop {
            if self.reader.is_none() {
                return Ok(None);
            }
            self.frame_offset = self.offset;

            let mut raw = [0u8; FRAME_HEADER_SIZE];
            let fill = {
                let reader = self.reader.as_mut().unwrap();
                read_fill(reader, &mut raw)?
            };
            match fill {
                Fill::Full => {}
                Fill::Eof => {
                    self.advance_segment()?;
                    continue;
                }
                Fill::Short => return self.torn_or_truncated(),
            }

            let header = match record::parse_header(&raw) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    // Zero-filled tail space: this segment is done.
                    self.advance_segment()?;
                    continue;
                }
                Err(reason) => {
                    return Err(WalError::CorruptRecord {
                        location: format!("{}@{}", self.segment_name(), self.frame_offset),
                        reason,
                    })
                }
            };

            let body_len = header.payload_len as usize + header.pad as usize;
            let mut body = vec![0u8; body_len];
            let fill = {
                let reader = self.reader.as_mut().unwrap();
                read_fill(reader, &mut body)?
            };
            match fill {
                Fill::Full => {}
                Fill::Eof | Fill::Short => return self.torn_or_truncated(),
            }
            body.truncate(header.payload_len as usize);

            self.offset += (FRAME_HEADER_SIZE + body_len) as u64;
            return Ok(Some(Record {
                kind: header.kind,
                checksum: header.checksum,
                payload: body,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::encoder::SegmentWriter;
    use raft_proto::eraftpb::Entry;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(bytes::Bytes::copy_from_slice(data));
        e
    }

    fn read_all(dir: &Path) -> Result<Vec<Record>> {
        let mut reader = WalReader::open(list_segments(dir)?)?;
        let mut records = Vec::new();
        while let Some(rec) = reader.next_record()? {
            records.push(rec);
        }
        Ok(records)
    }

    #[test]
    fn test_segment_name_round_trip() {
        let name = segment_file_name(3, 1_000);
        assert_eq!(parse_segment_name(&name), Some((3, 1_000)));
        assert_eq!(parse_segment_name("segment_3.log"), None);
        assert_eq!(parse_segment_name("wal_zz_00.log"), None);
    }

    #[test]
    fn test_empty_directory_yields_no_records() {
        let dir = TempDir::new().unwrap();
        let records = read_all(dir.path()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_multi_segment_transparency() {
        let whole = TempDir::new().unwrap();
        let split = TempDir::new().unwrap();

        // One unsplit segment.
        let mut w = SegmentWriter::create(whole.path(), 0, 0, 0).unwrap();
        for i in 1..=6u64 {
            w.append_entry(&entry(i, 1, format!("op-{}", i).as_bytes())).unwrap();
        }
        w.sync().unwrap();

        // The same records split at an arbitrary record boundary.
        let mut a = SegmentWriter::create(split.path(), 0, 0, 0).unwrap();
        for i in 1..=3u64 {
            a.append_entry(&entry(i, 1, format!("op-{}", i).as_bytes())).unwrap();
        }
        a.sync().unwrap();
        let mut b = SegmentWriter::create(split.path(), 1, 4, a.running_crc()).unwrap();
        for i in 4..=6u64 {
            b.append_entry(&entry(i, 1, format!("op-{}", i).as_bytes())).unwrap();
        }
        b.sync().unwrap();

        let unsplit = read_all(whole.path()).unwrap();
        let rejoined = read_all(split.path()).unwrap();
        assert_eq!(unsplit.len(), 6);
        assert_eq!(unsplit, rejoined);
    }

    #[test]
    fn test_checksum_prefix_resume() {
        let dir = TempDir::new().unwrap();

        let mut a = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        for i in 1..=4u64 {
            a.append_entry(&entry(i, 1, b"payload")).unwrap();
        }
        a.append_crc_boundary().unwrap();
        a.sync().unwrap();
        let mut b = SegmentWriter::create(dir.path(), 1, 5, a.running_crc()).unwrap();
        for i in 5..=8u64 {
            b.append_entry(&entry(i, 2, b"payload")).unwrap();
        }
        b.sync().unwrap();

        // Full replay from byte zero.
        let segments = list_segments(dir.path()).unwrap();
        let mut full = WalReader::open(segments.clone()).unwrap();
        while full.next_record().unwrap().is_some() {}
        let full_crc = full.current_crc();

        // Fresh decoder over the second segment only: the baseline crc
        // record at its head seeds the accumulator.
        let mut resumed = WalReader::open(segments[1..].to_vec()).unwrap();
        while resumed.next_record().unwrap().is_some() {}
        assert_eq!(resumed.current_crc(), full_crc);
    }

    #[test]
    fn test_flipped_payload_byte_fails_at_next_crc_record() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        w.append_entry(&entry(1, 1, b"first payload bytes")).unwrap();
        w.append_crc_boundary().unwrap();
        w.append_entry(&entry(2, 1, b"second payload bytes")).unwrap();
        w.sync().unwrap();

        let path = dir.path().join(segment_file_name(0, 0));
        let mut raw = std::fs::read(&path).unwrap();
        // First frame is the 24-byte baseline crc record; flip a byte
        // inside the entry payload that follows its header.
        raw[24 + FRAME_HEADER_SIZE + 2] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        let err = read_all(dir.path()).unwrap_err();
        assert!(matches!(err, WalError::CrcMismatch { .. }));
    }

    #[test]
    fn test_torn_tail_of_final_segment_ends_stream() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        for i in 1..=3u64 {
            w.append_entry(&entry(i, 1, b"some entry data")).unwrap();
        }
        w.sync().unwrap();

        let path = dir.path().join(segment_file_name(0, 0));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let records = read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_truncation_in_non_final_segment_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut a = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        a.append_entry(&entry(1, 1, b"some entry data")).unwrap();
        a.sync().unwrap();
        let mut b = SegmentWriter::create(dir.path(), 1, 2, a.running_crc()).unwrap();
        b.append_entry(&entry(2, 1, b"more entry data")).unwrap();
        b.sync().unwrap();

        let path = dir.path().join(segment_file_name(0, 0));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let err = read_all(dir.path()).unwrap_err();
        assert!(matches!(err, WalError::TruncatedFrame { .. }));
    }

    #[test]
    fn test_zero_filled_tail_is_clean_end() {
        let dir = TempDir::new().unwrap();
        let mut w = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        w.append_entry(&entry(1, 1, b"entry")).unwrap();
        w.sync().unwrap();

        let path = dir.path().join(segment_file_name(0, 0));
        let mut raw = std::fs::read(&path).unwrap();
        raw.resize(raw.len() + 64, 0);
        std::fs::write(&path, &raw).unwrap();

        let records = read_all(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_sequence_gap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut a = SegmentWriter::create(dir.path(), 0, 0, 0).unwrap();
        a.append_entry(&entry(1, 1, b"entry")).unwrap();
        a.sync().unwrap();
        let mut b = SegmentWriter::create(dir.path(), 2, 5, a.running_crc()).unwrap();
        b.append_entry(&entry(5, 1, b"entry")).unwrap();
        b.sync().unwrap();

        assert!(matches!(
            list_segments(dir.path()),
            Err(WalError::BadSegmentSequence(_))
        ));
    }
}
