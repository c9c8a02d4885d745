//! Durable log and snapshot subsystem of a replicated kv node: the
//! segment-file write-ahead log with its running-checksum discipline,
//! snapshot persistence cross-validated against the log, and the replay
//! and offline-repair procedures built on both.

pub mod backend;
pub mod config;
pub mod errors;
pub mod membership;
pub mod repair;
pub mod replay;
pub mod snapshot;
pub mod store;
pub mod wal;
