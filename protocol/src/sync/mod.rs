//! # Sync Module
//!
//! Catching up with the network in chunks of [`CHUNK_SIZE`] blocks.
//!
//! ## Architecture
//!
//! ```text
//! chunk.rs    chunk headers and data: generation and verification
//! manager.rs  the sync service: answers peers, runs catch-up rounds
//! ```
//!
//! A round asks every sync peer for chunk headers after our tail, accepts
//! the header set that at least √N of the N responders agree on, fetches
//! the chunk bodies from random agreeing peers and feeds the verified
//! blocks to the block pool in order. Minting is suspended for the whole
//! catch-up.
//!
//! [`CHUNK_SIZE`]: crate::config::CHUNK_SIZE

pub mod chunk;
pub mod manager;

use libp2p::PeerId;

use crate::chain::ChainError;
use crate::crypto::Hash;
use crate::network::{MessageError, NetService, PeerFilter, Priority, StreamError};
use crate::storage::TrieError;

pub use chunk::{
    generate_chunk_data, generate_chunk_headers, verify_chunk_data, ChainSync, ChunkData,
    ChunkHeader, ChunkHeaders,
};
pub use manager::SyncService;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("chunk root {0} does not match its hashes")]
    InvalidChunkRoot(Hash),

    #[error("chunk holds {got} blocks, header lists {expected}")]
    ChunkLengthMismatch { expected: usize, got: usize },

    #[error("block {hash} at position {index} does not match the chunk header")]
    InvalidBlockHashInChunk { index: usize, hash: Hash },

    #[error("block {0} not found")]
    UnknownBlock(Hash),

    #[error("no peers to sync from")]
    NoPeers,

    #[error("peers do not agree on chunk headers")]
    NoAgreement,

    #[error("chunk {0} timed out")]
    Timeout(Hash),

    #[error("sync already running")]
    AlreadyRunning,

    #[error(transparent)]
    Network(#[from] StreamError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Trie(#[from] TrieError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// The part of the network the sync service uses.
pub trait SyncNetwork: Send + Sync {
    /// Send to the chain-sync peer set, at most the configured sync fan-out.
    /// Returns the peers the request went to.
    fn request_sync_peers(&self, name: &str, data: Vec<u8>) -> Vec<PeerId>;

    fn request(&self, peer: &PeerId, name: &str, data: Vec<u8>) -> SyncResult<()>;
}

impl SyncNetwork for NetService {
    fn request_sync_peers(&self, name: &str, data: Vec<u8>) -> Vec<PeerId> {
        let filter = PeerFilter::ChainSync(self.config().max_sync_nodes);
        self.send_message_to_peers(name, data, Priority::Low, filter)
    }

    fn request(&self, peer: &PeerId, name: &str, data: Vec<u8>) -> SyncResult<()> {
        Ok(self.send_to(peer, name, data, Priority::Low)?)
    }
}
