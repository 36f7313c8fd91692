//! # Block
//!
//! A block header commits to three tries: the state after executing the
//! block, its transactions and the events those transactions emitted. The
//! header also carries the dynasty root in force at its timestamp and, above
//! the activation height, the proposer's VRF output.
//!
//! ## Lifecycle
//!
//! ```text
//! Block::new → execute txs → seal(state, events) → sign → broadcast
//!                                                           ↓
//!          peers: verify_integrity → verify_signature → replay via DAG
//! ```
//!
//! The block also carries the dependency DAG its proposer observed while
//! executing transactions in parallel, keyed by transaction hash. Peers use
//! it to replay execution with the same ordering constraints.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::events::Event;
use super::{ChainError, ChainResult};
use crate::crypto::vrf::VrfOutput;
use crate::crypto::{
    blake3_hash_many, recover_signer, Address, Hash, Keypair, PublicKey, Signature,
    SignatureAlgorithm,
};
use crate::storage::{MemoryStorage, Trie};
use crate::transaction::Transaction;
use crate::util::Dag;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub height: u64,
    /// Seconds. Always a multiple of the slot length.
    pub timestamp: i64,
    pub chain_id: u32,
    pub coinbase: Address,
    pub proposer: Address,
    pub state_root: Hash,
    pub txs_root: Hash,
    pub events_root: Hash,
    pub dynasty_root: Hash,
    pub random: Option<VrfOutput>,
    pub alg: SignatureAlgorithm,
    pub signer: Option<PublicKey>,
    pub signature: Signature,
}

impl BlockHeader {
    /// BLAKE3 over every field except the hash and the signature.
    pub fn calculate_hash(&self) -> Hash {
        let (seed, proof): (&[u8], &[u8]) = match &self.random {
            Some(r) => (r.seed.as_bytes(), &r.proof),
            None => (&[], &[]),
        };
        let coinbase = self.coinbase.to_bytes();
        let proposer = self.proposer.to_bytes();
        blake3_hash_many(&[
            self.parent_hash.as_bytes(),
            &self.height.to_be_bytes(),
            &self.timestamp.to_be_bytes(),
            &self.chain_id.to_be_bytes(),
            &coinbase,
            &proposer,
            self.state_root.as_bytes(),
            self.txs_root.as_bytes(),
            self.events_root.as_bytes(),
            self.dynasty_root.as_bytes(),
            seed,
            &(proof.len() as u32).to_be_bytes(),
            proof,
            &[u8::from(self.alg)],
        ])
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub dag: Dag<Hash>,
}

impl Block {
    /// An unsealed child of `parent` at `timestamp` seconds.
    pub fn new(
        chain_id: u32,
        coinbase: Address,
        proposer: Address,
        parent: &Block,
        timestamp: i64,
    ) -> Self {
        Self {
            header: BlockHeader {
                hash: Hash::ZERO,
                parent_hash: parent.hash(),
                height: parent.height() + 1,
                timestamp,
                chain_id,
                coinbase,
                proposer,
                state_root: Hash::ZERO,
                txs_root: Hash::ZERO,
                events_root: Hash::ZERO,
                dynasty_root: parent.header.dynasty_root,
                random: None,
                alg: SignatureAlgorithm::Ed25519,
                signer: None,
                signature: Signature::default(),
            },
            transactions: Vec::new(),
            dag: Dag::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn proposer(&self) -> Address {
        self.header.proposer
    }

    pub fn is_genesis(&self) -> bool {
        self.header.parent_hash.is_zero()
    }

    /// Fill in the roots and the hash. The transactions and the DAG must be
    /// final by now.
    pub fn seal(&mut self, state_root: Hash, events_root: Hash) -> ChainResult<()> {
        self.header.state_root = state_root;
        self.header.events_root = events_root;
        self.header.txs_root = txs_root(&self.transactions)?;
        self.header.hash = self.header.calculate_hash();
        Ok(())
    }

    pub fn sign(&mut self, keypair: &Keypair) -> ChainResult<()> {
        if keypair.address() != self.header.proposer {
            return Err(ChainError::InvalidBlock(
                "signing key does not belong to the proposer".into(),
            ));
        }
        self.header.signature = keypair.sign(self.header.hash.as_bytes());
        self.header.signer = Some(keypair.public_key());
        Ok(())
    }

    /// Recover the signer and check it is the proposer.
    pub fn verify_signature(&self) -> ChainResult<Address> {
        let signer = self
            .header
            .signer
            .as_ref()
            .ok_or_else(|| ChainError::InvalidBlock("unsigned block".into()))?;
        let addr = recover_signer(
            self.header.alg,
            signer,
            self.header.hash.as_bytes(),
            &self.header.signature,
        )
        .map_err(|_| ChainError::InvalidBlock("bad block signature".into()))?;
        if addr != self.header.proposer {
            return Err(ChainError::InvalidBlock(format!(
                "signed by {addr}, proposer is {}",
                self.header.proposer
            )));
        }
        Ok(addr)
    }

    /// Everything that can be checked without state: chain id, hash, txs
    /// root, every transaction, and the shape of the DAG.
    pub fn verify_integrity(&self, chain_id: u32) -> ChainResult<()> {
        if self.header.chain_id != chain_id {
            return Err(ChainError::InvalidBlock(format!(
                "chain id {} does not match {chain_id}",
                self.header.chain_id
            )));
        }
        if self.header.hash != self.header.calculate_hash() {
            return Err(ChainError::InvalidBlock("block hash mismatch".into()));
        }
        if self.header.txs_root != txs_root(&self.transactions)? {
            return Err(ChainError::InvalidBlock("txs root mismatch".into()));
        }
        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            tx.verify_integrity(chain_id)?;
            if !seen.insert(tx.hash) {
                return Err(ChainError::InvalidBlock(format!("duplicate tx {}", tx.hash)));
            }
            if !self.dag.contains(&tx.hash) {
                return Err(ChainError::InvalidBlock(format!("tx {} missing from dag", tx.hash)));
            }
        }
        if self.dag.len() != self.transactions.len() {
            return Err(ChainError::InvalidBlock("dag and tx list differ".into()));
        }
        if self.dag.is_cyclic() {
            return Err(ChainError::InvalidBlock("execution dag is cyclic".into()));
        }
        Ok(())
    }

    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ChainError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        bincode::deserialize(bytes).map_err(|e| ChainError::Codec(e.to_string()))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block #{} {} parent={} ts={} txs={}",
            self.height(),
            self.hash(),
            self.parent_hash(),
            self.timestamp(),
            self.transactions.len()
        )
    }
}

// ---------------------------------------------------------------------------
// Roots
// ---------------------------------------------------------------------------

fn scratch_trie() -> Trie {
    Trie::new(Arc::new(MemoryStorage::new()))
}

/// Trie of `tx hash → encoded tx`.
pub fn txs_root(txs: &[Transaction]) -> ChainResult<Hash> {
    let mut trie = scratch_trie();
    for tx in txs {
        trie.put(tx.hash.as_bytes(), &tx.encode()?)?;
    }
    Ok(trie.root_hash())
}

/// Trie of `tx hash ‖ event index → JSON event`.
pub fn events_root<'a>(
    events: impl IntoIterator<Item = (&'a Hash, &'a Vec<Event>)>,
) -> ChainResult<Hash> {
    let mut trie = scratch_trie();
    for (tx_hash, list) in events {
        for (i, ev) in list.iter().enumerate() {
            let mut key = tx_hash.to_vec();
            key.extend_from_slice(&(i as u32).to_be_bytes());
            let bytes = serde_json::to_vec(ev).map_err(|e| ChainError::Codec(e.to_string()))?;
            trie.put(&key, &bytes)?;
        }
    }
    Ok(trie.root_hash())
}
