//! LRU read cache over any [`Storage`].
//!
//! Write-through: every `put`/`del` goes to the inner storage first and only
//! then touches the cache, so the cache never holds something the backend
//! refused. Values larger than `max_entry_bytes` are never cached; a handful
//! of huge blocks would otherwise evict thousands of hot trie nodes.
//!
//! A batch only reaches the cache once the inner storage has applied it, so
//! a discarded batch never leaves anything behind here.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::kv::{BatchOp, Storage, StorageResult, WriteBatch};

pub const DEFAULT_MAX_ENTRY_BYTES: usize = 64 * 1024;

pub struct CachedStorage<S> {
    inner: S,
    cache: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
    max_entry_bytes: usize,
}

impl<S: Storage> CachedStorage<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self::with_entry_limit(inner, capacity, DEFAULT_MAX_ENTRY_BYTES)
    }

    pub fn with_entry_limit(inner: S, capacity: usize, max_entry_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(cap)),
            max_entry_bytes,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    fn remember(&self, key: &[u8], value: &[u8]) {
        if value.len() <= self.max_entry_bytes {
            self.cache.lock().put(key.to_vec(), value.to_vec());
        } else {
            self.cache.lock().pop(key);
        }
    }
}

impl<S: Storage> Storage for CachedStorage<S> {
    fn get(&self, key: &[u8]) -> StorageResult<Vec<u8>> {
        if let Some(v) = self.cache.lock().get(key) {
            return Ok(v.clone());
        }
        let v = self.inner.get(key)?;
        self.remember(key, &v);
        Ok(v)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.inner.put(key, value)?;
        self.remember(key, value);
        Ok(())
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        self.inner.del(key)?;
        self.cache.lock().pop(key);
        Ok(())
    }

    fn flush(&self, batch: &mut WriteBatch) -> StorageResult<()> {
        let ops: Vec<BatchOp> = batch.ops().cloned().collect();
        self.inner.flush(batch)?;
        for op in ops {
            match op.value {
                Some(v) => self.remember(&op.key, &v),
                None => {
                    self.cache.lock().pop(&op.key);
                }
            }
        }
        Ok(())
    }
}
