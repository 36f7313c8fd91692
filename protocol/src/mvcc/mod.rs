//! # MVCC State Engine
//!
//! Versioned key/value transactions over a [`Storage`](crate::storage::Storage).
//!
//! ```text
//! staging.rs: tree of versioned overlays, merge-to-parent with conflict
//!              detection and dependency tracking
//! db.rs     : Begin/Commit/Rollback lifecycle and Prepare/CheckAndUpdate
//!              for nested parallel transactions
//! ```
//!
//! Only [`MvccError::KeyConflict`] is meant to be handled by callers (abort
//! and retry the transaction). Everything else means the transaction is
//! gone.

pub mod db;
pub mod staging;

pub use db::MvccDb;
pub use staging::{StagingTable, Tid, ValueItem};

use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum MvccError {
    #[error("key conflict on {} key(s)", .0.len())]
    KeyConflict(Vec<Vec<u8>>),

    #[error("tid {0} already exists")]
    TidExists(Tid),

    #[error("tid {0} not found")]
    TidNotFound(Tid),

    #[error("not in a transaction")]
    NotInTransaction,

    #[error("transaction already open")]
    NestedTransaction,

    #[error("the root layer has no parent to merge into")]
    CannotMergeRoot,

    #[error("prepared handles cannot begin or roll back")]
    PreparedHandle,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MvccError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MvccError::KeyConflict(_))
    }
}

pub type MvccResult<T> = Result<T, MvccError>;
