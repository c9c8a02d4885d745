//! Reconstructs hard state, committed entries and cluster membership
//! from a data directory after a restart or for offline repair.
//!
//! Replay is a strictly sequential fold over the record stream; it runs
//! to completion or fails. A cluster built from an aborted replay must
//! never be used.

use raft_proto::eraftpb::{Entry, HardState};

use crate::backend::Backend;
use crate::config::RepairConfig;
use crate::errors::{Result, WalError};
use crate::membership::{Cluster, MEMBER_KEY_PREFIX};
use crate::snapshot::SnapStore;
use crate::store::KvStore;
use crate::wal;
use crate::wal::record::{SnapshotMark, WalMetadata};

#[derive(Debug)]
pub struct Replayed {
    pub metadata: Option<WalMetadata>,
    pub hard_state: HardState,
    /// Committed entries past the snapshot position.
    pub entries: Vec<Entry>,
    pub cluster: Cluster,
}

/// Replay the log directory into a live view of the node's state,
/// binding the given backend into the recovered cluster.
pub fn replay(cfg: &RepairConfig, backend: Box<dyn Backend>) -> Result<Replayed> {
    let wal_dir = cfg.wal_dir();
    let marks = wal::valid_snapshot_marks(&wal_dir)?;

    let snap_store = SnapStore::new(cfg.snap_dir());
    let snapshot = match snap_store.load_newest_available(&marks) {
        Ok(snapshot) => Some(snapshot),
        // No snapshot at all is the ordinary empty/initial condition.
        Err(WalError::NoSnapshot) => None,
        Err(e) => return Err(e),
    };

    let mut store = KvStore::new();
    let start = match &snapshot {
        Some(snapshot) => {
            store.recovery(snapshot.get_data())?;
            log::debug!(
                "state dump restored with {} member entries",
                store.keys_with_prefix(MEMBER_KEY_PREFIX).count()
            );
            let metadata = snapshot.get_metadata();
            SnapshotMark {
                index: metadata.index,
                term: metadata.term,
            }
        }
        None => SnapshotMark { index: 0, term: 0 },
    };
    log::info!(
        "replaying wal from index {} term {}",
        start.index,
        start.term
    );

    let log_replay = wal::read_log(&wal_dir, start)?;
    let commit = log_replay.hard_state.commit;
    let mut entries = log_replay.entries;
    entries.retain(|e| e.index <= commit);

    let mut cluster = Cluster::new();
    cluster.set_store(store);
    cluster.set_backend(backend);
    cluster.recover()?;

    Ok(Replayed {
        metadata: log_replay.metadata,
        hard_state: log_replay.hard_state,
        entries,
        cluster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileBackend;
    use crate::membership::Member;
    use crate::wal::encoder::SegmentWriter;
    use protobuf::Message as _;
    use raft_proto::eraftpb::Snapshot;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(bytes::Bytes::from(format!("op-{}", index).into_bytes()));
        e
    }

    fn state(term: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.commit = commit;
        hs
    }

    fn prepare_dirs(cfg: &RepairConfig) {
        std::fs::create_dir_all(cfg.wal_dir()).unwrap();
        std::fs::create_dir_all(cfg.snap_dir()).unwrap();
    }

    #[test]
    fn test_replay_without_snapshot() {
        let dir = TempDir::new().unwrap();
        let cfg = RepairConfig::new(dir.path());
        prepare_dirs(&cfg);

        let mut w = SegmentWriter::create(&cfg.wal_dir(), 0, 0, 0).unwrap();
        w.append_snapshot_mark(&SnapshotMark { index: 0, term: 0 }).unwrap();
        for i in 1..=4u64 {
            w.append_entry(&entry(i, 1)).unwrap();
        }
        w.append_state(&state(1, 3)).unwrap();
        w.sync().unwrap();

        let backend = FileBackend::open(cfg.backend_path()).unwrap();
        let replayed = replay(&cfg, Box::new(backend)).unwrap();

        // Entry 4 is past the commit index and must not surface.
        let indexes: Vec<u64> = replayed.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert_eq!(replayed.hard_state.commit, 3);
        assert!(replayed.cluster.members().is_empty());
    }

    #[test]
    fn test_replay_resumes_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let cfg = RepairConfig::new(dir.path());
        prepare_dirs(&cfg);

        // Cluster state as of the snapshot at index 3.
        let member = Member::new("n1", vec!["http://n1:2380".to_string()], Vec::new(), "t");
        let mut cluster = Cluster::new();
        cluster.add_member(member.clone()).unwrap();
        let dump = cluster.store().save().unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 3;
        snapshot.mut_metadata().term = 1;
        snapshot.mut_metadata().mut_conf_state().voters = vec![member.id];
        snapshot.set_data(bytes::Bytes::from(dump));
        SnapStore::new(cfg.snap_dir()).save_snapshot(&snapshot).unwrap();

        let mut w = SegmentWriter::create(&cfg.wal_dir(), 0, 0, 0).unwrap();
        w.append_metadata(&WalMetadata { node_id: 1, cluster_id: 9 }).unwrap();
        w.append_snapshot_mark(&SnapshotMark { index: 0, term: 0 }).unwrap();
        for i in 1..=5u64 {
            w.append_entry(&entry(i, 1)).unwrap();
        }
        w.append_snapshot_mark(&SnapshotMark { index: 3, term: 1 }).unwrap();
        w.append_state(&state(1, 5)).unwrap();
        w.sync().unwrap();

        let mut backend = FileBackend::open(cfg.backend_path()).unwrap();
        backend.lock();
        backend.put_member(&member).unwrap();
        backend.unlock();
        backend.force_commit().unwrap();

        let backend = FileBackend::open(cfg.backend_path()).unwrap();
        let replayed = replay(&cfg, Box::new(backend)).unwrap();

        let indexes: Vec<u64> = replayed.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![4, 5]);
        assert_eq!(replayed.metadata, Some(WalMetadata { node_id: 1, cluster_id: 9 }));
        assert_eq!(replayed.cluster.members(), vec![member]);
    }

    #[test]
    fn test_corrupt_log_aborts_replay() {
        let dir = TempDir::new().unwrap();
        let cfg = RepairConfig::new(dir.path());
        prepare_dirs(&cfg);

        let mut w = SegmentWriter::create(&cfg.wal_dir(), 0, 0, 0).unwrap();
        w.append_entry(&entry(1, 1)).unwrap();
        w.append_crc_boundary().unwrap();
        w.append_entry(&entry(2, 1)).unwrap();
        w.sync().unwrap();

        let path = cfg
            .wal_dir()
            .join(crate::wal::decoder::segment_file_name(0, 0));
        let mut raw = std::fs::read(&path).unwrap();
        raw[24 + crate::wal::record::FRAME_HEADER_SIZE] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        let backend = FileBackend::open(cfg.backend_path()).unwrap();
        let err = replay(&cfg, Box::new(backend)).unwrap_err();
        assert!(matches!(err, WalError::CrcMismatch { .. }));
    }

    #[test]
    fn test_state_record_shape_survives_protobuf() {
        // The state payload is an opaque protobuf blob to the codec.
        let hs = state(3, 9);
        let bytes = hs.write_to_bytes().unwrap();
        let mut parsed = HardState::default();
        parsed.merge_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hs);
    }
}
