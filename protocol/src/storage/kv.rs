//! # Key/Value Storage Interface
//!
//! Everything persistent in the node (blocks, trie nodes, chain metadata)
//! goes through the narrow [`Storage`] trait: `get`/`put`/`del` plus
//! batches. `enable_batch` hands the caller a [`WriteBatch`] of its own.
//! Writes into it are buffered in memory keyed by `hex(key)`, so repeated
//! writes to one key collapse into the last one; `flush` hands the whole
//! batch to the backend as one atomic write and `disable_batch` drops it.
//!
//! A batch belongs to whoever opened it. Writes made directly on the
//! storage by other tasks while a batch is open go straight through and are
//! never folded into, or thrown away with, somebody else's batch. Reads
//! that must see buffered writes go through [`WriteBatch::get`].
//!
//! Two backends ship: [`MemoryStorage`] (tests, throwaway nodes) and
//! [`super::db::SledStorage`] (the default on disk).

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key not found")]
    NotFound,

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("storage failure: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound)
    }
}

/// The contract every backend implements.
///
/// All methods take `&self`; backends own their synchronisation so a
/// storage can be shared as `Arc<dyn Storage>`.
pub trait Storage: Send + Sync {
    /// Returns [`StorageError::NotFound`] for a missing key.
    fn get(&self, key: &[u8]) -> StorageResult<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;
    fn del(&self, key: &[u8]) -> StorageResult<()>;

    /// Start a batch owned by the caller. Nothing in it is visible to other
    /// readers until [`flush`](Self::flush).
    fn enable_batch(&self) -> WriteBatch {
        WriteBatch::default()
    }

    /// Write every op in `batch` atomically. On success the batch is emptied
    /// and can be filled again; on failure it keeps its ops.
    fn flush(&self, batch: &mut WriteBatch) -> StorageResult<()>;

    /// Drop `batch`, discarding anything not yet flushed.
    fn disable_batch(&self, batch: WriteBatch) {
        drop(batch);
    }
}

/// Convenience: `get` that maps `NotFound` to `None`.
pub fn get_opt(storage: &dyn Storage, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
    match storage.get(key) {
        Ok(v) => Ok(Some(v)),
        Err(StorageError::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Write batch
// ---------------------------------------------------------------------------

/// One pending write. `value == None` is a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Writes collected by one caller, applied together by [`Storage::flush`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: BTreeMap<String, BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.record(key, Some(value.to_vec()));
    }

    pub fn del(&mut self, key: &[u8]) {
        self.record(key, None);
    }

    fn record(&mut self, key: &[u8], value: Option<Vec<u8>>) {
        self.ops.insert(
            hex::encode(key),
            BatchOp {
                key: key.to_vec(),
                value,
            },
        );
    }

    /// `Some(Some(v))` buffered put, `Some(None)` buffered delete, `None` not
    /// in the batch.
    pub fn lookup(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops
            .get(&hex::encode(key))
            .map(|op| op.value.as_deref())
    }

    /// Read `key` as it will be once this batch is flushed to `storage`.
    pub fn get(&self, storage: &dyn Storage, key: &[u8]) -> StorageResult<Vec<u8>> {
        match self.lookup(key) {
            Some(Some(v)) => Ok(v.to_vec()),
            Some(None) => Err(StorageError::NotFound),
            None => storage.get(key),
        }
    }

    pub fn ops(&self) -> impl Iterator<Item = &BatchOp> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// Hash-map backend. Flush applies the batch under a single write lock,
/// which is as atomic as memory gets.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Vec<u8>> {
        self.data.read().get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn flush(&self, batch: &mut WriteBatch) -> StorageResult<()> {
        let mut data = self.data.write();
        for op in batch.ops() {
            match &op.value {
                Some(v) => data.insert(op.key.clone(), v.clone()),
                None => data.remove(&op.key),
            };
        }
        batch.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_is_not_found() {
        let s = MemoryStorage::new();
        assert!(s.get(b"nope").unwrap_err().is_not_found());
        assert_eq!(get_opt(&s, b"nope").unwrap(), None);
    }

    #[test]
    fn put_get_del() {
        let s = MemoryStorage::new();
        s.put(b"k", b"v").unwrap();
        assert_eq!(s.get(b"k").unwrap(), b"v");
        s.del(b"k").unwrap();
        assert!(s.get(b"k").is_err());
    }

    #[test]
    fn batch_writes_are_invisible_to_the_backend_until_flush() {
        let s = MemoryStorage::new();
        let mut batch = s.enable_batch();
        batch.put(b"a", b"1");
        batch.put(b"a", b"2");
        batch.put(b"b", b"3");
        batch.del(b"b");
        assert_eq!(batch.len(), 2);
        assert!(s.is_empty());

        // Reads through the batch see it; plain reads do not.
        assert_eq!(batch.get(&s, b"a").unwrap(), b"2");
        assert!(batch.get(&s, b"b").unwrap_err().is_not_found());
        assert!(s.get(b"a").is_err());

        s.flush(&mut batch).unwrap();
        assert!(batch.is_empty());
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(b"a").unwrap(), b"2");
        s.disable_batch(batch);
    }

    #[test]
    fn disable_discards_unflushed_writes() {
        let s = MemoryStorage::new();
        s.put(b"keep", b"x").unwrap();
        let mut batch = s.enable_batch();
        batch.put(b"drop", b"y");
        batch.del(b"keep");
        s.disable_batch(batch);
        assert!(s.get(b"drop").is_err());
        assert_eq!(s.get(b"keep").unwrap(), b"x");
    }

    #[test]
    fn writes_outside_an_open_batch_are_kept() {
        let s = MemoryStorage::new();
        let mut batch = s.enable_batch();
        batch.put(b"blockchain_tail", b"t");
        s.flush(&mut batch).unwrap();

        // Another writer lands between flush and disable.
        s.put(b"blockchain_lib", b"l").unwrap();
        s.disable_batch(batch);
        assert_eq!(s.get(b"blockchain_lib").unwrap(), b"l");
        assert_eq!(s.get(b"blockchain_tail").unwrap(), b"t");
    }

    #[test]
    fn concurrent_batches_do_not_share_ops() {
        let s = MemoryStorage::new();
        let mut first = s.enable_batch();
        let mut second = s.enable_batch();
        first.put(b"a", b"1");
        second.put(b"b", b"2");

        s.flush(&mut first).unwrap();
        assert_eq!(s.get(b"a").unwrap(), b"1");
        assert!(s.get(b"b").is_err());

        s.disable_batch(second);
        assert!(s.get(b"b").is_err());
        assert_eq!(s.get(b"a").unwrap(), b"1");
    }
}
