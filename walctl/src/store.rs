use std::collections::BTreeMap;
use std::io;

use crate::errors::Result;

/// In-memory key-value state, the legacy state-machine dump embedded in
/// a snapshot's data blob. Membership attributes live here under
/// `members/` keys so a snapshot carries the member table along with the
/// voter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl KvStore {
    pub fn new() -> KvStore {
        KvStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> {
        self.data.keys().filter(move |k| k.starts_with(prefix))
    }

    /// Serialize the whole state for embedding in a snapshot.
    pub fn save(&self) -> Result<Vec<u8>> {
        let data = serde_json::to_vec(&self.data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(data)
    }

    /// Replace the state with a previously saved dump. An empty dump
    /// resets to the initial empty state.
    pub fn recovery(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.data.clear();
            return Ok(());
        }
        self.data = serde_json::from_slice(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_recovery_round_trip() {
        let mut store = KvStore::new();
        store.put("members/01", "{\"name\":\"a\"}");
        store.put("members/02", "{\"name\":\"b\"}");
        store.put("version", "1");

        let dump = store.save().unwrap();
        let mut recovered = KvStore::new();
        recovered.recovery(&dump).unwrap();
        assert_eq!(recovered, store);
    }

    #[test]
    fn test_empty_dump_resets() {
        let mut store = KvStore::new();
        store.put("k", "v");
        store.recovery(&[]).unwrap();
        assert_eq!(store, KvStore::new());
    }

    #[test]
    fn test_prefix_scan_and_delete() {
        let mut store = KvStore::new();
        store.put("members/01", "a");
        store.put("members/02", "b");
        store.put("other", "c");

        let members: Vec<&String> = store.keys_with_prefix("members/").collect();
        assert_eq!(members.len(), 2);

        assert!(store.delete("members/01"));
        assert!(!store.delete("members/01"));
        assert_eq!(store.keys_with_prefix("members/").count(), 1);
    }
}
