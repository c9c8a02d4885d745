//! Offline repair procedures: operations on a node's durable state with
//! no consensus process running.
//!
//! A mutation touches three independently persisted artifacts (backend
//! store, snapshot, wal-recorded marks) with no cross-file transaction.
//! The ordering below always commits and closes the backend before the
//! snapshot is rewritten, so a failure partway leaves "backend updated,
//! snapshot stale" rather than a snapshot that resurrects state the
//! backend already dropped. Nothing is retried automatically; the
//! operator re-runs the listing to inspect the result before acting
//! again.

use raft_proto::eraftpb::{Entry, HardState};

use crate::backend::{Backend, FileBackend};
use crate::config::RepairConfig;
use crate::errors::{Result, WalError};
use crate::membership::{Cluster, Member};
use crate::replay;
use crate::snapshot::SnapStore;
use crate::wal;
use crate::wal::record::WalMetadata;

pub struct RecoveredCluster {
    pub cluster: Cluster,
    pub snap_store: SnapStore,
    pub metadata: Option<WalMetadata>,
    pub hard_state: HardState,
    pub entries: Vec<Entry>,
}

/// Replay the data directory into a membership view backed by the file
/// backend. Fails fast if the wal directory is not writable.
pub fn recover_membership_cluster(cfg: &RepairConfig) -> Result<RecoveredCluster> {
    cfg.ensure_writable()?;

    let backend = FileBackend::open(cfg.backend_path())?;
    let replayed = replay::replay(cfg, Box::new(backend))?;

    Ok(RecoveredCluster {
        cluster: replayed.cluster,
        snap_store: SnapStore::new(cfg.snap_dir()),
        metadata: replayed.metadata,
        hard_state: replayed.hard_state,
        entries: replayed.entries,
    })
}

pub struct MemberListing {
    /// Members sorted by id.
    pub members: Vec<Member>,
    pub metadata: Option<WalMetadata>,
}

/// Read-only: the current member set as the durable state knows it.
pub fn list_members(cfg: &RepairConfig) -> Result<MemberListing> {
    let mut recovered = recover_membership_cluster(cfg)?;
    let members = recovered.cluster.members();
    if let Some(mut backend) = recovered.cluster.take_backend() {
        backend.close()?;
    }
    Ok(MemberListing {
        members,
        metadata: recovered.metadata,
    })
}

/// Forcibly remove a member from the durable state.
///
/// Sequence: in-memory removal, push to the backend, force-commit and
/// close the backend, then reload the newest snapshot, filter the member
/// out of its voter set, refresh its embedded state dump and save it.
/// Any error after the backend commit is surfaced verbatim and leaves
/// the documented backend-new/snapshot-stale window.
pub fn remove_member(cfg: &RepairConfig, member_id: u64) -> Result<()> {
    let mut recovered = recover_membership_cluster(cfg)?;
    let cluster = &mut recovered.cluster;

    let found = match cluster.member(member_id) {
        Some(member) => member.name.clone(),
        None => {
            if let Some(mut backend) = cluster.take_backend() {
                let _ = backend.close();
            }
            return Err(WalError::MemberNotFound(member_id));
        }
    };
    log::info!("removing member {:016x} name={:?}", member_id, found);

    cluster.remove_member(member_id)?;
    cluster.push_membership_to_storage()?;

    let mut backend = cluster
        .take_backend()
        .ok_or_else(|| WalError::Backend("no backend bound".to_string()))?;
    backend.force_commit()?;
    backend.close()?;

    // The removal must also reach the hard state the next boot replays:
    // drop the member from the newest snapshot's voter set and refresh
    // the embedded dump so it agrees with the backend.
    let marks = wal::valid_snapshot_marks(&cfg.wal_dir())?;
    let mut snapshot = recovered.snap_store.load_newest_available(&marks)?;

    let voters: Vec<u64> = snapshot
        .get_metadata()
        .get_conf_state()
        .voters
        .iter()
        .copied()
        .filter(|voter| *voter != member_id)
        .collect();
    snapshot.mut_metadata().mut_conf_state().voters = voters;

    let dump = cluster.store().save()?;
    snapshot.set_data(bytes::Bytes::from(dump));
    recovered.snap_store.save_snapshot(&snapshot)?;

    log::info!(
        "member {:016x} removed; snapshot at index {} rewritten",
        member_id,
        snapshot.get_metadata().index
    );
    Ok(())
}
