//! MVCC database handle.
//!
//! A root handle owns the transaction lifecycle: `begin` creates a staging
//! table whose root reads through to storage, `commit` writes the root's
//! dirty items to storage in one batch. `prepare(tid)` returns a second
//! handle bound to a child staging node; it shares the table with the root
//! handle and can itself prepare grandchildren.
//!
//! Only one root transaction can be open at a time. That single rule is
//! what keeps block application and LIB updates from interleaving.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::staging::{StagingTable, Tid};
use super::{MvccError, MvccResult};
use crate::storage::kv::{get_opt, Storage};

const ROOT_TID: &str = "mvcc.root";

pub struct MvccDb {
    storage: Arc<dyn Storage>,
    tid: Tid,
    prepared: bool,
    staging: Mutex<Option<Arc<StagingTable>>>,
}

impl fmt::Debug for MvccDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MvccDb")
            .field("tid", &self.tid)
            .field("prepared", &self.prepared)
            .field("in_transaction", &self.is_in_transaction())
            .finish()
    }
}

impl MvccDb {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            tid: Tid::from(ROOT_TID),
            prepared: false,
            staging: Mutex::new(None),
        }
    }

    pub fn tid(&self) -> &Tid {
        &self.tid
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn is_in_transaction(&self) -> bool {
        self.staging.lock().is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn table(&self) -> MvccResult<Arc<StagingTable>> {
        self.staging.lock().clone().ok_or(MvccError::NotInTransaction)
    }

    // -- Lifecycle ------------------------------------------------------------

    pub fn begin(&self) -> MvccResult<()> {
        if self.prepared {
            return Err(MvccError::PreparedHandle);
        }
        let mut staging = self.staging.lock();
        if staging.is_some() {
            return Err(MvccError::NestedTransaction);
        }
        *staging = Some(Arc::new(StagingTable::new(
            self.storage.clone(),
            self.tid.clone(),
        )));
        Ok(())
    }

    /// A prepared handle merges into its parent. A root handle writes every
    /// dirty item through to storage atomically; if storage refuses, the
    /// whole transaction is rolled back.
    pub fn commit(&self) -> MvccResult<()> {
        let table = {
            let mut staging = self.staging.lock();
            staging.take().ok_or(MvccError::NotInTransaction)?
        };

        if self.prepared {
            let result = table.merge_to_parent(&self.tid);
            if result.is_ok() {
                table.purge(&self.tid)?;
            } else {
                // Keep the handle usable so the caller can roll it back.
                *self.staging.lock() = Some(table);
            }
            return result.map(|_| ());
        }

        let items = table.dirty_items(&self.tid)?;
        let mut batch = self.storage.enable_batch();
        for (key, item) in &items {
            match item.visible() {
                Some(value) => batch.put(key, value),
                None => batch.del(key),
            }
        }
        let written = self.storage.flush(&mut batch);
        self.storage.disable_batch(batch);

        match written {
            Ok(()) => {
                debug!(keys = items.len(), "mvcc transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "mvcc commit failed, transaction rolled back");
                Err(e.into())
            }
        }
    }

    /// Throw the staging layer away. Storage is untouched.
    pub fn rollback(&self) -> MvccResult<()> {
        let table = self
            .staging
            .lock()
            .take()
            .ok_or(MvccError::NotInTransaction)?;
        if self.prepared {
            table.purge(&self.tid)?;
        }
        Ok(())
    }

    // -- Nested transactions --------------------------------------------------

    /// A handle on a new child staging node under this handle's tid.
    pub fn prepare(&self, tid: Tid) -> MvccResult<MvccDb> {
        let table = self.table()?;
        table.prepare(&self.tid, tid.clone())?;
        Ok(MvccDb {
            storage: self.storage.clone(),
            tid,
            prepared: true,
            staging: Mutex::new(Some(table)),
        })
    }

    /// Merge the prepared child `tid` into this handle's layer. Returns the
    /// tids the child depended on. On conflict the child is left in place.
    pub fn check_and_update(&self, tid: &Tid) -> MvccResult<Vec<Tid>> {
        let table = self.table()?;
        let deps = table.merge_to_parent(tid)?;
        table.purge(tid)?;
        Ok(deps)
    }

    /// Drop the prepared child `tid` without merging.
    pub fn reset(&self, tid: &Tid) -> MvccResult<()> {
        self.table()?.purge(tid)
    }

    // -- Data -----------------------------------------------------------------

    pub fn get(&self, key: &[u8]) -> MvccResult<Option<Vec<u8>>> {
        match self.staging.lock().clone() {
            Some(table) => Ok(table.get(&self.tid, key)?.visible().map(<[u8]>::to_vec)),
            None => Ok(get_opt(&*self.storage, key)?),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> MvccResult<()> {
        match self.staging.lock().clone() {
            Some(table) => table.put(&self.tid, key, value),
            None => Ok(self.storage.put(key, value)?),
        }
    }

    pub fn del(&self, key: &[u8]) -> MvccResult<()> {
        match self.staging.lock().clone() {
            Some(table) => table.del(&self.tid, key),
            None => Ok(self.storage.del(key)?),
        }
    }
}
