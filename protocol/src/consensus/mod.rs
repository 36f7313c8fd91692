//! # Consensus Module
//!
//! Proof-of-Devotion: a committee (the dynasty) takes turns minting one
//! block per fixed-length slot, and a block becomes irreversible once
//! enough distinct committee members have built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! dynasty.rs  committee stored as a trie, slot → proposer
//! pod.rs      mint loop, block verification, fork choice, LIB, witnesses
//! ```
//!
//! The [`BlockPool`](crate::chain::BlockPool) only sees the [`Consensus`]
//! trait. It calls `verify_block` before executing a block, then
//! `fork_choice` and `update_lib` once the block is stored.

pub mod dynasty;
pub mod pod;

use std::sync::Arc;

use crate::chain::{Block, Blockchain, ChainError};
use crate::crypto::{Address, Hash};
use crate::storage::{CacheError, StorageError, TrieError};
use crate::transaction::TxError;

pub use dynasty::{serial_of, Dynasty};
pub use pod::{DynastyProvider, NoContract, PodEngine, Witness};

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("timestamp {0} is not a valid slot")]
    InvalidTimestamp(i64),

    #[error("slot belongs to {expected}, block is from {got}")]
    WrongProposer { expected: Address, got: Address },

    #[error("{0} is not in the dynasty")]
    NotInDynasty(Address),

    #[error("dynasty root mismatch for serial {0}")]
    DynastyMismatch(u64),

    #[error("no dynasty for serial {0}")]
    DynastyNotFound(u64),

    #[error("second block {second} for slot {timestamp}, first was {first}")]
    DoubleMint {
        timestamp: i64,
        first: Hash,
        second: Hash,
    },

    #[error("block above the activation height carries no VRF output")]
    MissingVrf,

    #[error("VRF output does not verify")]
    InvalidVrf,

    #[error("bad witness: {0}")]
    InvalidWitness(String),

    #[error("minting is disabled")]
    MintDisabled,

    #[error("minting is suspended while syncing")]
    MintPending,

    #[error("outside the mint window")]
    OutsideMintWindow,

    #[error("slot {0} is already taken")]
    SlotOccupied(i64),

    #[error("not our slot")]
    NotOurTurn,

    #[error("no miner key configured")]
    NoMinerKey,

    #[error("dynasty contract: {0}")]
    Contract(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Trie(#[from] TrieError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Tx(#[from] TxError),
}

impl ConsensusError {
    /// Outcomes of a mint tick that just mean "not this time".
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            ConsensusError::MintDisabled
                | ConsensusError::MintPending
                | ConsensusError::OutsideMintWindow
                | ConsensusError::SlotOccupied(_)
                | ConsensusError::NotOurTurn
        )
    }
}

pub type ConsensusResult<T> = Result<T, ConsensusError>;

/// What the block pool needs from a consensus engine.
pub trait Consensus: Send + Sync {
    /// Consensus rules for `block`, whose parent is already stored.
    fn verify_block(&self, chain: &Blockchain, block: &Block) -> ConsensusResult<()>;

    /// Move the tail to the best detached tail. Returns the new tail if it
    /// changed.
    fn fork_choice(&self, chain: &Blockchain) -> ConsensusResult<Option<Arc<Block>>>;

    /// Advance the LIB if the chain above it allows. Returns whether it
    /// moved.
    fn update_lib(&self, chain: &Blockchain) -> ConsensusResult<bool>;

    /// Stop minting until [`resume_mint`](Self::resume_mint).
    fn suspend_mint(&self);

    fn resume_mint(&self);
}
