use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::errors::{Result, WalError};
use crate::membership::Member;

/// Transactional key-value storage holding membership and other durable
/// server state. The live server owns its own implementation; offline
/// tooling only needs this surface. Mutations are scoped inside explicit
/// `lock`/`unlock` transaction boundaries and become durable only on
/// `force_commit` or `close`.
pub trait Backend {
    fn lock(&mut self);
    fn unlock(&mut self);
    fn put_member(&mut self, member: &Member) -> Result<()>;
    fn delete_member(&mut self, id: u64) -> Result<()>;
    fn all_members(&self) -> Result<Vec<Member>>;
    fn force_commit(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// File-backed adapter used by the offline repair path: the member table
/// is held in memory and written out as one atomic file replacement on
/// commit. A crash before `force_commit` leaves the previous file
/// untouched.
pub struct FileBackend {
    path: PathBuf,
    members: BTreeMap<u64, Member>,
    locked: bool,
    dirty: bool,
    closed: bool,
}

impl FileBackend {
    pub fn open(path: impl Into<PathBuf>) -> Result<FileBackend> {
        let path = path.into();
        let members = if path.exists() {
            let data = fs::read(&path)?;
            bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        } else {
            BTreeMap::new()
        };
        Ok(FileBackend {
            path,
            members,
            locked: false,
            dirty: false,
            closed: false,
        })
    }

    fn persist(&mut self) -> Result<()> {
        let data = bincode::serialize(&self.members)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let tmp = self.path.with_extension("tmp");
        let result = (|| -> Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&tmp, &self.path)?;
            if let Some(parent) = self.path.parent() {
                File::open(parent)?.sync_all()?;
            }
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }

        self.dirty = false;
        log::debug!("backend committed to {}", self.path.display());
        Ok(())
    }

    fn check_open_and_locked(&self) -> Result<()> {
        if self.closed {
            return Err(WalError::Backend("backend is closed".to_string()));
        }
        if !self.locked {
            return Err(WalError::Backend(
                "member write outside a transaction".to_string(),
            ));
        }
        Ok(())
    }
}

impl Backend for FileBackend {
    fn lock(&mut self) {
        self.locked = true;
    }

    fn unlock(&mut self) {
        self.locked = false;
    }

    fn put_member(&mut self, member: &Member) -> Result<()> {
        self.check_open_and_locked()?;
        self.members.insert(member.id, member.clone());
        self.dirty = true;
        Ok(())
    }

    fn delete_member(&mut self, id: u64) -> Result<()> {
        self.check_open_and_locked()?;
        if self.members.remove(&id).is_none() {
            return Err(WalError::MemberNotFound(id));
        }
        self.dirty = true;
        Ok(())
    }

    fn all_members(&self) -> Result<Vec<Member>> {
        Ok(self.members.values().cloned().collect())
    }

    fn force_commit(&mut self) -> Result<()> {
        if self.closed {
            return Err(WalError::Backend("backend is closed".to_string()));
        }
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.force_commit()?;
        self.closed = true;
        Ok(())
    }
}
