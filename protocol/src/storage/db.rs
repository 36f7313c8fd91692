//! # SledStorage: Persistent Storage Backend
//!
//! The on-disk [`Storage`] implementation, built on sled's embedded
//! key-value store. The chain keeps a single flat keyspace (blocks, trie
//! nodes and metadata are told apart by key prefix), so one sled `Tree` is
//! all we need.
//!
//! ## Atomicity
//!
//! `flush` converts the caller's [`WriteBatch`] into a `sled::Batch` and
//! applies it in one call. Either every write lands or none does. If sled
//! refuses the batch, its ops stay in the caller's batch so it can retry or
//! disable the batch to discard them.

use std::path::Path;

use sled::{Batch, Db, Tree};

use super::kv::{Storage, StorageError, StorageResult, WriteBatch};

const CHAIN_TREE: &str = "chain";

/// sled-backed storage. Cheap to clone; clones share the same database.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: Db,
    tree: Tree,
}

impl SledStorage {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in a temp dir and disappears on drop. No
    /// filesystem cleanup needed in tests.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let tree = db.open_tree(CHAIN_TREE)?;
        Ok(Self { db, tree })
    }

    /// Number of persisted keys.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Block until every write so far is durable.
    pub fn sync(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Vec<u8>> {
        self.tree
            .get(key)?
            .map(|v| v.to_vec())
            .ok_or(StorageError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn flush(&self, batch: &mut WriteBatch) -> StorageResult<()> {
        let mut sled_batch = Batch::default();
        for op in batch.ops() {
            match &op.value {
                Some(v) => sled_batch.insert(op.key.as_slice(), v.as_slice()),
                None => sled_batch.remove(op.key.as_slice()),
            }
        }
        self.tree.apply_batch(sled_batch)?;
        batch.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_temporary_database() {
        let db = SledStorage::open_temporary().expect("should create temp db");
        assert!(db.is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = SledStorage::open(dir.path()).expect("should open db");
            db.put(b"blockchain_tail", b"abc").unwrap();
            db.sync().unwrap();
        }
        let db = SledStorage::open(dir.path()).expect("should reopen db");
        assert_eq!(db.get(b"blockchain_tail").unwrap(), b"abc");
    }

    #[test]
    fn missing_key_is_not_found() {
        let db = SledStorage::open_temporary().unwrap();
        assert!(db.get(b"ghost").unwrap_err().is_not_found());
    }

    #[test]
    fn batch_is_applied_atomically_on_flush() {
        let db = SledStorage::open_temporary().unwrap();
        db.put(b"old", b"1").unwrap();

        let mut batch = db.enable_batch();
        for i in 0u8..10 {
            batch.put(&[b'k', i], &[i]);
        }
        batch.del(b"old");
        assert_eq!(db.len(), 1, "nothing hits sled before flush");
        assert!(batch.get(&db, b"old").is_err(), "buffered delete is visible through the batch");
        assert_eq!(db.get(b"old").unwrap(), b"1");

        db.flush(&mut batch).unwrap();
        db.disable_batch(batch);
        assert_eq!(db.len(), 10);
        assert_eq!(db.get(&[b'k', 7]).unwrap(), vec![7]);
    }

    #[test]
    fn clones_write_through_while_a_batch_is_open() {
        let db = SledStorage::open_temporary().unwrap();
        let other = db.clone();
        let mut batch = db.enable_batch();
        batch.put(b"tail", b"t");
        other.put(b"lib", b"l").unwrap();
        assert_eq!(db.get(b"lib").unwrap(), b"l");
        db.disable_batch(batch);
        assert_eq!(other.get(b"lib").unwrap(), b"l");
        assert!(db.get(b"tail").is_err());
    }
}
