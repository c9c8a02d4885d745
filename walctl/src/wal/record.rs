use std::io;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, WalError};

pub const FRAME_HEADER_SIZE: usize = 16; // 8 bytes length + kind + pad + 2 reserved + 4 bytes checksum
pub const FRAME_ALIGN: usize = 8;

// Defensive cap on a single payload; a length word beyond this is treated
// as frame corruption rather than attempted as an allocation.
const MAX_PAYLOAD_LEN: u64 = 1 << 30;

/// Discriminates how a record payload is interpreted during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Metadata = 0,
    Entry = 1,
    State = 2,
    Crc = 3,
    SnapshotMark = 4,
}

impl RecordKind {
    pub fn from_byte(b: u8) -> Option<RecordKind> {
        match b {
            0 => Some(RecordKind::Metadata),
            1 => Some(RecordKind::Entry),
            2 => Some(RecordKind::State),
            3 => Some(RecordKind::Crc),
            4 => Some(RecordKind::SnapshotMark),
            _ => None,
        }
    }
}

/// The atomic unit of the log. Records are immutable once written; the
/// log only ever appends new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordKind,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

/// Marks a snapshot cut inside the log itself. The snapshot store only
/// trusts snapshot files whose (index, term) appears among these marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMark {
    pub index: u64,
    pub term: u64,
}

/// Node and cluster identity, recorded at the head of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalMetadata {
    pub node_id: u64,
    pub cluster_id: u64,
}

/// Parsed fixed header of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u64,
    pub kind: RecordKind,
    pub pad: u8,
    pub checksum: u32,
}

pub fn padding_for(payload_len: usize) -> usize {
    (FRAME_ALIGN - payload_len % FRAME_ALIGN) % FRAME_ALIGN
}

/// Continue a crc32 stream: `seed` is the checksum of everything folded
/// so far, the return value covers `seed`'s bytes plus `data`.
pub fn fold_crc(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

fn read_u64_le(buf: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(raw)
}

fn read_u32_le(buf: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(raw)
}

/// Parse a 16-byte frame header. `Ok(None)` signals an all-zero header,
/// which terminates a segment (zero-filled tail space). An inconsistent
/// header is reported with a reason; the caller adds location context.
pub fn parse_header(buf: &[u8; FRAME_HEADER_SIZE]) -> std::result::Result<Option<FrameHeader>, String> {
    if buf.iter().all(|b| *b == 0) {
        return Ok(None);
    }

    let payload_len = read_u64_le(&buf[0..8]);
    let kind = match RecordKind::from_byte(buf[8]) {
        Some(kind) => kind,
        None => return Err(format!("unknown record kind {}", buf[8])),
    };
    let pad = buf[9];
    if buf[10] != 0 || buf[11] != 0 {
        return Err("reserved header bytes are not zero".to_string());
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(format!("payload length {} out of range", payload_len));
    }
    if pad as usize != padding_for(payload_len as usize) {
        return Err(format!(
            "padding {} does not match payload length {}",
            pad, payload_len
        ));
    }
    let checksum = read_u32_le(&buf[12..16]);

    Ok(Some(FrameHeader {
        payload_len,
        kind,
        pad,
        checksum,
    }))
}

impl Record {
    pub fn new(kind: RecordKind, checksum: u32, payload: Vec<u8>) -> Record {
        Record {
            kind,
            checksum,
            payload,
        }
    }

    /// A checksum attestation record. The running value is stored both in
    /// the payload and in the header checksum field.
    pub fn crc_record(value: u32) -> Record {
        Record {
            kind: RecordKind::Crc,
            checksum: value,
            payload: value.to_le_bytes().to_vec(),
        }
    }

    /// The running checksum carried by a `Crc` record.
    pub fn crc_value(&self) -> Option<u32> {
        if self.kind != RecordKind::Crc || self.payload.len() != 4 {
            return None;
        }
        Some(read_u32_le(&self.payload))
    }

    /// Serialize to a length-prefixed, 8-byte aligned frame. Never fails
    /// for a well-formed record.
    pub fn encode(&self) -> Vec<u8> {
        let pad = padding_for(self.payload.len());
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len() + pad);
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(pad as u8);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.resize(buf.len() + pad, 0);
        buf
    }

    /// Parse one frame out of a byte buffer. Checksum validity is not
    /// inspected here: the running checksum spans records, so the segment
    /// reader owns that verification.
    pub fn decode(buf: &[u8]) -> Result<Record> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(corrupt("frame", "shorter than a frame header"));
        }
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = match parse_header(&raw) {
            Ok(Some(header)) => header,
            Ok(None) => return Err(corrupt("frame", "all-zero header")),
            Err(reason) => return Err(corrupt("frame", &reason)),
        };
        let total = FRAME_HEADER_SIZE + header.payload_len as usize + header.pad as usize;
        if buf.len() < total {
            return Err(corrupt("frame", "payload shorter than header claims"));
        }
        let payload = buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + header.payload_len as usize].to_vec();
        Ok(Record {
            kind: header.kind,
            checksum: header.checksum,
            payload,
        })
    }

    /// Encoded frame size, header and alignment padding included.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len() + padding_for(self.payload.len())
    }
}

fn corrupt(location: &str, reason: &str) -> WalError {
    WalError::CorruptRecord {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}

impl SnapshotMark {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    pub fn decode(payload: &[u8]) -> io::Result<SnapshotMark> {
        bincode::deserialize(payload).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl WalMetadata {
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    pub fn decode(payload: &[u8]) -> io::Result<WalMetadata> {
        bincode::deserialize(payload).map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}
