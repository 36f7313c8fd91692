//! # Chain Module
//!
//! Blocks, state, execution and the canonical chain.
//!
//! ## Architecture
//!
//! ```text
//! block.rs      : Block / BlockHeader, sealing, signing, roots
//! world_state.rs: account trie behind an MVCC database
//! executor.rs   : parallel tx execution (mint) and DAG replay (verify)
//! blockchain.rs : storage of blocks, canonical index, tail, LIB
//! block_pool.rs : sole writer: verify, execute, link, fork choice
//! events.rs     : broadcast bus for chain events
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! newblock / sync ──► BlockPool ──► PodEngine::verify_block
//!                        │
//!                        ├──► Executor::apply_block (WorldState + DAG)
//!                        ├──► Blockchain::store_block
//!                        └──► PodEngine::fork_choice / update_lib
//! ```

pub mod block;
pub mod block_pool;
pub mod blockchain;
pub mod events;
pub mod executor;
pub mod world_state;

pub use block::{Block, BlockHeader};
pub use block_pool::BlockPool;
pub use blockchain::Blockchain;
pub use events::{Event, EventBus};
pub use executor::{BlockContext, Executor, ExecutionOutcome, NoVm, Receipt, Vm};
pub use world_state::{Account, AccountStore, TrieStorage, TxState, WorldState};

use crate::crypto::{Address, Hash};
use crate::mvcc::MvccError;
use crate::storage::{StorageError, TrieError};
use crate::transaction::TxError;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("block {0} not found")]
    BlockNotFound(Hash),

    #[error("parent {0} not found")]
    MissingParent(Hash),

    #[error("block {0} already known")]
    DuplicateBlock(Hash),

    #[error("block at height {height} does not descend from LIB at {lib}")]
    NotAfterLib { height: u64, lib: u64 },

    #[error("insufficient balance in {0}")]
    InsufficientBalance(Address),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("consensus rejected block: {0}")]
    Consensus(String),

    #[error("chain codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Mvcc(#[from] MvccError),

    #[error(transparent)]
    Trie(#[from] TrieError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tx(#[from] TxError),
}

pub type ChainResult<T> = Result<T, ChainError>;
