//! Cluster membership as reconstructed by offline replay.
//!
//! The backend store is the authoritative source of live member
//! attributes; the newest snapshot's conf state is the authoritative
//! voter set. The two can disagree while a reconfiguration is in flight,
//! and nothing here silently prefers one over the other.

use serde_derive::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use crate::backend::Backend;
use crate::errors::{Result, WalError};
use crate::store::KvStore;

/// Derive a member id from its identity: the sorted peer URLs plus the
/// cluster name, hashed, truncated to 64 bits. Order-independent so the
/// same member always derives the same id.
pub fn compute_member_id(peer_urls: &[String], cluster_name: &str) -> u64 {
    let mut sorted: Vec<&String> = peer_urls.iter().collect();
    sorted.sort();

    let mut hasher = Sha3_256::new();
    for url in sorted {
        hasher.update(url.as_bytes());
    }
    hasher.update(cluster_name.as_bytes());
    let digest = hasher.finalize();

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(raw)
}

/// One cluster member. An empty name means the member was admitted to
/// the voter set but has never successfully started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

impl Member {
    pub fn new(
        name: &str,
        peer_urls: Vec<String>,
        client_urls: Vec<String>,
        cluster_name: &str,
    ) -> Member {
        Member {
            id: compute_member_id(&peer_urls, cluster_name),
            name: name.to_string(),
            peer_urls,
            client_urls,
        }
    }

    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }
}

pub(crate) const MEMBER_KEY_PREFIX: &str = "members/";

pub(crate) fn member_store_key(id: u64) -> String {
    format!("{}{:016x}", MEMBER_KEY_PREFIX, id)
}

/// The current member set, bound to a backend store for durable
/// persistence and a kv store for the state dump embedded in snapshots.
/// Owned exclusively by whichever process holds it.
#[derive(Default)]
pub struct Cluster {
    members: std::collections::BTreeMap<u64, Member>,
    store: KvStore,
    backend: Option<Box<dyn Backend>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("members", &self.members)
            .field("store", &self.store)
            .field("backend", &self.backend.as_ref().map(|_| "<backend>"))
            .finish()
    }
}

impl Cluster {
    pub fn new() -> Cluster {
        Cluster::default()
    }

    pub fn set_store(&mut self, store: KvStore) {
        self.store = store;
    }

    pub fn set_backend(&mut self, backend: Box<dyn Backend>) {
        self.backend = Some(backend);
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn take_backend(&mut self) -> Option<Box<dyn Backend>> {
        self.backend.take()
    }

    /// Re-derive the member objects from whatever the backend persisted.
    pub fn recover(&mut self) -> Result<()> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| WalError::Backend("no backend bound".to_string()))?;
        let persisted = backend.all_members()?;

        self.members.clear();
        for member in persisted {
            if self.store.get(&member_store_key(member.id)).is_none() {
                log::warn!(
                    "member {:016x} is missing from the state dump (reconfiguration in flight?)",
                    member.id
                );
            }
            log::info!(
                "recovered member {:016x} name={:?} peers={:?}",
                member.id,
                member.name,
                member.peer_urls
            );
            self.members.insert(member.id, member);
        }
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member(&self, id: u64) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Members sorted by id.
    pub fn members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn add_member(&mut self, member: Member) -> Result<()> {
        let value = serde_json::to_string(&member)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        self.store.put(member_store_key(member.id), value);
        self.members.insert(member.id, member);
        Ok(())
    }

    /// Drop a member from the in-memory set and the kv state dump. The
    /// backend is untouched until `push_membership_to_storage`.
    pub fn remove_member(&mut self, id: u64) -> Result<()> {
        if self.members.remove(&id).is_none() {
            return Err(WalError::MemberNotFound(id));
        }
        self.store.delete(&member_store_key(id));
        log::info!("removed member {:016x} from the cluster state", id);
        Ok(())
    }

    /// Write the current member set into the backend, inside one
    /// lock/unlock transaction: members the backend still has but the
    /// cluster no longer does are deleted, then every current member is
    /// put.
    pub fn push_membership_to_storage(&mut self) -> Result<()> {
        let members: Vec<Member> = self.members.values().cloned().collect();
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| WalError::Backend("no backend bound".to_string()))?;

        backend.lock();
        let result = push_members(backend.as_mut(), &members);
        backend.unlock();
        result
    }
}

fn push_members(backend: &mut dyn Backend, members: &[Member]) -> Result<()> {
    for stale in backend.all_members()? {
        if !members.iter().any(|m| m.id == stale.id) {
            backend.delete_member(stale.id)?;
        }
    }
    for member in members {
        backend.put_member(member)?;
    }
    Ok(())
}
