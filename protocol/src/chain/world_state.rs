//! # World State
//!
//! Account state of one block: a Merkle trie of `address → account`, read
//! and written through an [`MvccDb`] so block execution can run
//! transactions in parallel.
//!
//! The glue is [`TrieStorage`], which makes a trie look like a plain
//! [`Storage`]. MVCC commit writes into the trie, and the trie root after
//! commit is the block's state root. Flushing a batch applies its ops
//! inside the trie's own batch mode, so a failing op restores the old root
//! and none of the batch shows.

use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;

use super::{ChainError, ChainResult};
use crate::crypto::{Address, Hash};
use crate::mvcc::{MvccDb, Tid};
use crate::storage::{Storage, StorageError, StorageResult, Trie, TrieError, WriteBatch};
use crate::transaction::types::u256_bytes;

// ---------------------------------------------------------------------------
// TrieStorage
// ---------------------------------------------------------------------------

pub struct TrieStorage {
    trie: Mutex<Trie>,
}

impl TrieStorage {
    pub fn new(trie: Trie) -> Self {
        Self {
            trie: Mutex::new(trie),
        }
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.lock().root_hash()
    }

    /// A copy of the trie at its current root.
    pub fn snapshot(&self) -> Trie {
        self.trie.lock().clone()
    }
}

fn backend(e: TrieError) -> StorageError {
    match e {
        TrieError::Storage(s) => s,
        TrieError::NotFound => StorageError::NotFound,
        other => StorageError::Backend(other.to_string()),
    }
}

impl Storage for TrieStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Vec<u8>> {
        self.trie
            .lock()
            .get(key)
            .map_err(backend)?
            .ok_or(StorageError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.trie.lock().put(key, value).map_err(backend)?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        match self.trie.lock().del(key) {
            Ok(_) | Err(TrieError::NotFound) => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }

    fn flush(&self, batch: &mut WriteBatch) -> StorageResult<()> {
        let mut trie = self.trie.lock();
        trie.begin_batch().map_err(backend)?;
        let applied = batch.ops().try_for_each(|op| match &op.value {
            Some(v) => trie.put(&op.key, v).map(|_| ()),
            None => match trie.del(&op.key) {
                Ok(_) | Err(TrieError::NotFound) => Ok(()),
                Err(e) => Err(e),
            },
        });
        match applied {
            Ok(()) => {
                trie.commit().map_err(backend)?;
                batch.clear();
                Ok(())
            }
            Err(e) => {
                trie.rollback().map_err(backend)?;
                Err(backend(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Account {
    pub balance: U256,
    /// Nonce of the last executed transaction of this account.
    pub nonce: u64,
}

impl Account {
    const ENCODED_LEN: usize = 40;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&u256_bytes(&self.balance));
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ChainError::Codec(format!(
                "account record of {} bytes",
                bytes.len()
            )));
        }
        let nonce = crate::util::codec::decode_u64(&bytes[32..])
            .map_err(|e| ChainError::Codec(e.to_string()))?;
        Ok(Self {
            balance: U256::from_big_endian(&bytes[..32]),
            nonce,
        })
    }
}

/// Account access shared by the block-level state and per-transaction
/// views.
pub trait AccountStore {
    fn mvcc(&self) -> &MvccDb;

    fn account(&self, address: &Address) -> ChainResult<Account> {
        match self.mvcc().get(&address.to_bytes())? {
            Some(bytes) => Account::decode(&bytes),
            None => Ok(Account::default()),
        }
    }

    fn put_account(&self, address: &Address, account: &Account) -> ChainResult<()> {
        self.mvcc().put(&address.to_bytes(), &account.encode())?;
        Ok(())
    }

    fn add_balance(&self, address: &Address, amount: U256) -> ChainResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut acc = self.account(address)?;
        acc.balance = acc
            .balance
            .checked_add(amount)
            .ok_or_else(|| ChainError::Codec("balance overflow".into()))?;
        self.put_account(address, &acc)
    }

    fn sub_balance(&self, address: &Address, amount: U256) -> ChainResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut acc = self.account(address)?;
        acc.balance = acc
            .balance
            .checked_sub(amount)
            .ok_or(ChainError::InsufficientBalance(*address))?;
        self.put_account(address, &acc)
    }
}

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

/// Block-level state. `begin` opens the MVCC transaction that block
/// execution runs in; `commit` folds it into the trie.
pub struct WorldState {
    trie: Arc<TrieStorage>,
    db: MvccDb,
}

impl std::fmt::Debug for WorldState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldState")
            .field("root", &self.trie.root_hash())
            .finish()
    }
}

impl WorldState {
    /// Empty state.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::from_trie(Trie::new(storage))
    }

    /// State as of `root`.
    pub fn at(storage: Arc<dyn Storage>, root: Hash) -> ChainResult<Self> {
        Ok(Self::from_trie(Trie::open(storage, root)?))
    }

    fn from_trie(trie: Trie) -> Self {
        let trie = Arc::new(TrieStorage::new(trie));
        let db = MvccDb::new(trie.clone());
        Self { trie, db }
    }

    pub fn root(&self) -> Hash {
        self.trie.root_hash()
    }

    pub fn begin(&self) -> ChainResult<()> {
        Ok(self.db.begin()?)
    }

    /// Write the transaction into the trie and return the new root.
    pub fn commit(&self) -> ChainResult<Hash> {
        self.db.commit()?;
        Ok(self.root())
    }

    pub fn rollback(&self) -> ChainResult<()> {
        Ok(self.db.rollback()?)
    }

    pub fn prepare(&self, tid: Tid) -> ChainResult<TxState> {
        Ok(TxState {
            db: self.db.prepare(tid)?,
        })
    }

    pub fn check_and_update(&self, tid: &Tid) -> ChainResult<Vec<Tid>> {
        Ok(self.db.check_and_update(tid)?)
    }

    pub fn reset(&self, tid: &Tid) -> ChainResult<()> {
        Ok(self.db.reset(tid)?)
    }
}

impl AccountStore for WorldState {
    fn mvcc(&self) -> &MvccDb {
        &self.db
    }
}

/// One transaction's view of the block state.
#[derive(Debug)]
pub struct TxState {
    db: MvccDb,
}

impl TxState {
    pub fn tid(&self) -> &Tid {
        self.db.tid()
    }
}

impl AccountStore for TxState {
    fn mvcc(&self) -> &MvccDb {
        &self.db
    }
}
