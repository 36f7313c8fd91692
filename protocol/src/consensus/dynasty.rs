//! Dynasties: the proposer committees.
//!
//! A dynasty is stored as a trie of `address → address` so a block header
//! can commit to it with a single root. Members are kept in byte order of
//! the address, and that order is what slot assignment indexes into.

use std::fmt;
use std::sync::Arc;

use crate::crypto::{Address, Hash};
use crate::storage::{Storage, Trie, TrieError, TrieResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Dynasty {
    serial: u64,
    root: Hash,
    members: Vec<Address>,
}

impl Dynasty {
    /// Write `members` into a new trie over `storage`.
    pub fn create(storage: Arc<dyn Storage>, serial: u64, members: &[Address]) -> TrieResult<Self> {
        let mut trie = Trie::new(storage.clone());
        for m in members {
            let key = m.to_bytes();
            trie.put(&key, &key)?;
        }
        Self::load(storage, serial, trie.root_hash())
    }

    /// Read the dynasty whose trie root is `root`.
    pub fn load(storage: Arc<dyn Storage>, serial: u64, root: Hash) -> TrieResult<Self> {
        let trie = Trie::open(storage, root)?;
        let mut members = Vec::new();
        for entry in trie.iter() {
            let (_, value) = entry?;
            let addr = Address::from_bytes(&value).map_err(|e| TrieError::Codec(e.to_string()))?;
            members.push(addr);
        }
        // The trie yields hashed-key order.
        members.sort();
        Ok(Self {
            serial,
            root,
            members,
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn members(&self) -> &[Address] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.members.binary_search(address).is_ok()
    }

    /// The member entitled to mint the slot starting at `timestamp`
    /// seconds.
    pub fn proposer_at(&self, timestamp: i64, block_interval_secs: u64) -> Option<Address> {
        if self.members.is_empty() || block_interval_secs == 0 || timestamp < 0 {
            return None;
        }
        let slot = timestamp as u64 / block_interval_secs;
        let index = (slot % self.members.len() as u64) as usize;
        self.members.get(index).copied()
    }

    /// Same dynasty under another serial.
    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }
}

impl fmt::Debug for Dynasty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dynasty")
            .field("serial", &self.serial)
            .field("root", &self.root)
            .field("size", &self.members.len())
            .finish()
    }
}

/// Dynasty serial in force at `timestamp` seconds.
pub fn serial_of(timestamp: i64, genesis_timestamp: i64, dynasty_interval_ms: u64) -> u64 {
    if dynasty_interval_ms == 0 || timestamp <= genesis_timestamp {
        return 0;
    }
    (timestamp - genesis_timestamp) as u64 * 1000 / dynasty_interval_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::storage::MemoryStorage;

    fn members(n: usize) -> Vec<Address> {
        (0..n).map(|_| Keypair::generate().address()).collect()
    }

    #[test]
    fn members_come_back_sorted() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let m = members(7);
        let d = Dynasty::create(storage.clone(), 0, &m).unwrap();
        let mut sorted = m.clone();
        sorted.sort();
        assert_eq!(d.members(), sorted.as_slice());

        let reloaded = Dynasty::load(storage, 3, d.root()).unwrap();
        assert_eq!(reloaded.members(), d.members());
        assert_eq!(reloaded.serial(), 3);
    }

    #[test]
    fn root_ignores_member_order() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let m = members(5);
        let mut rev = m.clone();
        rev.reverse();
        let a = Dynasty::create(storage.clone(), 0, &m).unwrap();
        let b = Dynasty::create(storage, 0, &rev).unwrap();
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn slots_rotate_through_members() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let d = Dynasty::create(storage, 0, &members(3)).unwrap();
        let m = d.members().to_vec();
        assert_eq!(d.proposer_at(0, 15), Some(m[0]));
        assert_eq!(d.proposer_at(15, 15), Some(m[1]));
        assert_eq!(d.proposer_at(44, 15), Some(m[2]));
        assert_eq!(d.proposer_at(45, 15), Some(m[0]));
        assert_eq!(d.proposer_at(-1, 15), None);
    }

    #[test]
    fn serial_counts_whole_intervals() {
        assert_eq!(serial_of(1000, 1000, 3_600_000), 0);
        assert_eq!(serial_of(1000 + 3599, 1000, 3_600_000), 0);
        assert_eq!(serial_of(1000 + 3600, 1000, 3_600_000), 1);
        assert_eq!(serial_of(1000 + 7300, 1000, 3_600_000), 2);
    }
}
