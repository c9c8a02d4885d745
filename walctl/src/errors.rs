use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalError>;

/// Errors raised while reading, validating or repairing the durable log
/// and snapshot state. Format corruption and checksum failures are fatal
/// to the running operation and are never retried: retrying re-reads the
/// same bytes.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("corrupt record at {location}: {reason}")]
    CorruptRecord { location: String, reason: String },

    #[error("crc mismatch in {segment} at offset {offset}: record holds {stored:#010x}, running value is {running:#010x}")]
    CrcMismatch {
        segment: String,
        offset: u64,
        stored: u32,
        running: u32,
    },

    #[error("truncated record frame in {segment} at offset {offset}")]
    TruncatedFrame { segment: String, offset: u64 },

    #[error("wal segment {0} breaks the file sequence")]
    BadSegmentSequence(String),

    #[error("wal metadata records disagree across segments")]
    MetadataConflict,

    #[error("snapshot mark index={index} term={term} was never recorded in the wal")]
    SnapshotMismatch { index: u64, term: u64 },

    /// No snapshot file exists at all. A valid initial-bootstrap
    /// condition, distinct from `NoValidSnapshot`.
    #[error("no snapshot available")]
    NoSnapshot,

    /// Snapshot files exist but none matches a wal snapshot mark.
    #[error("snapshot files exist but none matches a wal mark")]
    NoValidSnapshot,

    #[error("member {0:016x} not found")]
    MemberNotFound(u64),

    #[error("backend: {0}")]
    Backend(String),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
