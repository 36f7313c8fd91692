//! Chunks: fixed runs of canonical blocks, addressed by the trie root of
//! their hashes.
//!
//! ```text
//! sync point P ─┬─ chunk 0: blocks P+1 ..= P+32   root₀ = trie(hashes)
//!               ├─ chunk 1: blocks P+33 ..= P+64  root₁
//!               └─ ...                            root  = trie(root₀, root₁, ...)
//! ```
//!
//! Only full chunks are ever offered, so every node that agrees on the
//! chain agrees on the headers byte for byte.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{SyncError, SyncResult};
use crate::chain::{Block, Blockchain, ChainError};
use crate::config::{CHUNK_SIZE, MAX_CHUNK_PER_SYNC_REQUEST};
use crate::crypto::Hash;
use crate::storage::{MemoryStorage, Storage, Trie};

/// `ChainSync`: "send me chunk headers after this block".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSync {
    pub tail_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub hashes: Vec<Hash>,
    pub root: Hash,
}

/// `ChainChunks` reply. `root` commits to the header roots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkHeaders {
    pub headers: Vec<ChunkHeader>,
    pub root: Hash,
}

impl ChunkHeaders {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Every header root matches its hashes and `root` matches the header
    /// roots. An empty reply carries the zero root.
    pub fn verify(&self) -> SyncResult<()> {
        if self.headers.is_empty() {
            if self.root.is_zero() {
                return Ok(());
            }
            return Err(SyncError::InvalidChunkRoot(self.root));
        }
        for header in &self.headers {
            if hashes_root(&header.hashes)? != header.root {
                return Err(SyncError::InvalidChunkRoot(header.root));
            }
        }
        let roots: Vec<Hash> = self.headers.iter().map(|h| h.root).collect();
        if hashes_root(&roots)? != self.root {
            return Err(SyncError::InvalidChunkRoot(self.root));
        }
        Ok(())
    }
}

/// `ChainChunkData` reply: the blocks of one chunk, lowest height first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    pub blocks: Vec<Block>,
    pub root: Hash,
}

/// Root of a scratch trie holding `hash → hash` for every entry.
pub fn hashes_root(hashes: &[Hash]) -> SyncResult<Hash> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let mut trie = Trie::new(storage);
    for h in hashes {
        trie.put(h.as_bytes(), h.as_bytes())?;
    }
    Ok(trie.root_hash())
}

/// Headers for up to [`MAX_CHUNK_PER_SYNC_REQUEST`] full chunks right
/// after `sync_point`. A sync point we do not hold on the canonical chain
/// yields no headers.
pub fn generate_chunk_headers(chain: &Blockchain, sync_point: &Hash) -> SyncResult<ChunkHeaders> {
    let blocks = match chain.canonical_after(sync_point, CHUNK_SIZE * MAX_CHUNK_PER_SYNC_REQUEST) {
        Ok(blocks) => blocks,
        Err(ChainError::BlockNotFound(_)) | Err(ChainError::InvalidBlock(_)) => {
            return Ok(ChunkHeaders::default())
        }
        Err(e) => return Err(e.into()),
    };
    let mut headers = Vec::with_capacity(blocks.len() / CHUNK_SIZE);
    for chunk in blocks.chunks_exact(CHUNK_SIZE) {
        let hashes: Vec<Hash> = chunk.iter().map(|b| b.hash()).collect();
        headers.push(ChunkHeader {
            root: hashes_root(&hashes)?,
            hashes,
        });
    }
    if headers.is_empty() {
        return Ok(ChunkHeaders::default());
    }
    let roots: Vec<Hash> = headers.iter().map(|h| h.root).collect();
    Ok(ChunkHeaders {
        root: hashes_root(&roots)?,
        headers,
    })
}

/// The blocks a header names, in order.
pub fn generate_chunk_data(chain: &Blockchain, header: &ChunkHeader) -> SyncResult<ChunkData> {
    let mut blocks = Vec::with_capacity(header.hashes.len());
    for hash in &header.hashes {
        let block = chain.get_block(hash)?.ok_or(SyncError::UnknownBlock(*hash))?;
        blocks.push(block.as_ref().clone());
    }
    Ok(ChunkData {
        blocks,
        root: header.root,
    })
}

/// Check `data` against the agreed `header` before any block is applied.
pub fn verify_chunk_data(header: &ChunkHeader, data: &ChunkData) -> SyncResult<()> {
    if data.blocks.len() != header.hashes.len() {
        return Err(SyncError::ChunkLengthMismatch {
            expected: header.hashes.len(),
            got: data.blocks.len(),
        });
    }
    for (index, (block, expected)) in data.blocks.iter().zip(&header.hashes).enumerate() {
        if block.header.calculate_hash() != block.hash() || block.hash() != *expected {
            return Err(SyncError::InvalidBlockHashInChunk {
                index,
                hash: block.hash(),
            });
        }
    }
    let hashes: Vec<Hash> = data.blocks.iter().map(|b| b.hash()).collect();
    if hashes_root(&hashes)? != header.root {
        return Err(SyncError::InvalidChunkRoot(header.root));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::blockchain::tests::{empty_child, genesis_config};
    use crate::crypto::{blake3_hash, Keypair};

    /// A chain of `n` empty blocks above genesis, all canonical.
    fn chain_of(n: usize) -> Blockchain {
        let kp = Keypair::from_seed(&[7; 32]);
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let chain = Blockchain::open(storage, &genesis_config(&[kp.address()], &[])).unwrap();
        let mut parent = chain.genesis();
        for i in 1..=n {
            let b = Arc::new(empty_child(&parent, 15 * i as i64, &kp));
            chain.store_block(b.clone()).unwrap();
            parent = b;
        }
        chain.set_tail(parent).unwrap();
        chain
    }

    #[test]
    fn only_full_chunks_are_offered() {
        let chain = chain_of(70);
        let headers = generate_chunk_headers(&chain, &chain.genesis().hash()).unwrap();
        assert_eq!(headers.headers.len(), 2);
        headers.verify().unwrap();

        let near_tail = chain.hash_at_height(50).unwrap().unwrap();
        let none = generate_chunk_headers(&chain, &near_tail).unwrap();
        assert!(none.is_empty());
        none.verify().unwrap();
        assert!(generate_chunk_headers(&chain, &blake3_hash(b"unknown")).unwrap().is_empty());
    }

    #[test]
    fn chunk_data_matches_its_header() {
        let chain = chain_of(32);
        let headers = generate_chunk_headers(&chain, &chain.genesis().hash()).unwrap();
        let header = &headers.headers[0];
        let data = generate_chunk_data(&chain, header).unwrap();
        verify_chunk_data(header, &data).unwrap();

        let mut short = data.clone();
        short.blocks.pop();
        assert!(matches!(
            verify_chunk_data(header, &short),
            Err(SyncError::ChunkLengthMismatch { expected: 32, got: 31 })
        ));

        let mut tampered = data;
        tampered.blocks[4].header.timestamp += 1;
        assert!(matches!(
            verify_chunk_data(header, &tampered),
            Err(SyncError::InvalidBlockHashInChunk { index: 4, .. })
        ));
    }

    #[test]
    fn forged_header_root_is_caught() {
        let chain = chain_of(32);
        let mut headers = generate_chunk_headers(&chain, &chain.genesis().hash()).unwrap();
        headers.headers[0].hashes[0] = blake3_hash(b"forged");
        assert!(matches!(headers.verify(), Err(SyncError::InvalidChunkRoot(_))));
    }
}
