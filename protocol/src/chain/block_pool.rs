//! Block pool: the single writer of the main chain.
//!
//! Blocks arrive from gossip, from chunk sync and from the local mint
//! loop. Each one is checked for integrity, parked if its parent is
//! unknown, then verified by consensus, replayed, stored and linked.
//! Parked children of a newly linked block follow it in the same pass.
//!
//! Every write happens under one async lock, so fork choice and LIB
//! updates always see a chain that is not changing underneath them.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::block::Block;
use super::blockchain::Blockchain;
use super::executor::Executor;
use super::{ChainError, ChainResult};
use crate::config::ORPHAN_BLOCK_CACHE_SIZE;
use crate::consensus::Consensus;
use crate::crypto::Hash;
use crate::network::{Broadcaster, InboundMessage, Priority, NEW_BLOCK};
use crate::transaction::TxPool;

pub struct BlockPool {
    chain: Arc<Blockchain>,
    engine: Arc<dyn Consensus>,
    executor: Executor,
    tx_pool: Arc<TxPool>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    /// Blocks waiting for their parent, keyed by parent hash.
    orphans: Mutex<LruCache<Hash, Vec<Arc<Block>>>>,
    write: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("chain", &self.chain)
            .field("orphans", &self.orphans.lock().len())
            .finish()
    }
}

impl BlockPool {
    pub fn new(
        chain: Arc<Blockchain>,
        engine: Arc<dyn Consensus>,
        executor: Executor,
        tx_pool: Arc<TxPool>,
    ) -> Self {
        let cap = NonZeroUsize::new(ORPHAN_BLOCK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            chain,
            engine,
            executor,
            tx_pool,
            broadcaster: None,
            orphans: Mutex::new(LruCache::new(cap)),
            write: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn engine(&self) -> &Arc<dyn Consensus> {
        &self.engine
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn tx_pool(&self) -> &Arc<TxPool> {
        &self.tx_pool
    }

    /// Number of parent hashes with children waiting.
    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Offer a block. Returns `true` if it was linked into the chain now,
    /// `false` if it was already known or is waiting for its parent.
    /// Blocks from the network are relayed once linked.
    pub async fn push_block(&self, block: Block, from_network: bool) -> ChainResult<bool> {
        block.verify_integrity(self.chain.chain_id())?;
        let hash = block.hash();
        if self.chain.contains(&hash)? {
            trace!(%hash, "block already known");
            return Ok(false);
        }
        let lib = self.chain.lib();
        if block.height() <= lib.height() {
            return Err(ChainError::NotAfterLib {
                height: block.height(),
                lib: lib.height(),
            });
        }

        let block = Arc::new(block);
        let _guard = self.write.lock().await;
        if !self.chain.contains(&block.parent_hash())? {
            debug!(%hash, parent = %block.parent_hash(), height = block.height(), "orphan block parked");
            let mut orphans = self.orphans.lock();
            match orphans.get_mut(&block.parent_hash()) {
                Some(waiting) if !waiting.iter().any(|b| b.hash() == hash) => waiting.push(block),
                Some(_) => {}
                None => {
                    orphans.put(block.parent_hash(), vec![block]);
                }
            }
            return Ok(false);
        }

        self.link(block.clone()).await?;
        if from_network {
            self.relay(&block);
        }

        // Children that were waiting on this block.
        let mut ready = self.take_orphans(&hash);
        while let Some(child) = ready.pop() {
            let child_hash = child.hash();
            match self.link(child).await {
                Ok(()) => ready.extend(self.take_orphans(&child_hash)),
                Err(e) => warn!(hash = %child_hash, error = %e, "parked block rejected"),
            }
        }
        self.advance()?;
        Ok(true)
    }

    /// Link a block minted by this node, then announce it.
    pub async fn push_local(&self, block: Block) -> ChainResult<()> {
        let hash = block.hash();
        let bytes = block.encode()?;
        if self.push_block(block, false).await? {
            if let Some(b) = &self.broadcaster {
                b.broadcast(NEW_BLOCK, bytes, Priority::Normal);
            }
            info!(%hash, "block announced");
        }
        Ok(())
    }

    fn take_orphans(&self, parent: &Hash) -> Vec<Arc<Block>> {
        self.orphans.lock().pop(parent).unwrap_or_default()
    }

    fn relay(&self, block: &Block) {
        let Some(b) = &self.broadcaster else {
            return;
        };
        match block.encode() {
            Ok(bytes) => b.relay(NEW_BLOCK, bytes, Priority::Normal),
            Err(e) => warn!(hash = %block.hash(), error = %e, "block encode failed"),
        }
    }

    /// Verify, replay and store one block whose parent is stored.
    async fn link(&self, block: Arc<Block>) -> ChainResult<()> {
        let parent = self
            .chain
            .get_block(&block.parent_hash())?
            .ok_or(ChainError::MissingParent(block.parent_hash()))?;
        let lib = self.chain.lib();
        if !self.chain.is_descendant(&lib, &parent)? {
            return Err(ChainError::NotAfterLib {
                height: block.height(),
                lib: lib.height(),
            });
        }
        self.engine
            .verify_block(&self.chain, &block)
            .map_err(|e| ChainError::Consensus(e.to_string()))?;

        let world = Arc::new(self.chain.state_at(&parent)?);
        self.executor.apply_block(world, &block).await?;
        self.chain.store_block(block.clone())?;
        self.tx_pool.prune(&block.transactions);
        debug!(
            height = block.height(),
            hash = %block.hash(),
            txs = block.transactions.len(),
            "block linked"
        );
        Ok(())
    }

    fn advance(&self) -> ChainResult<()> {
        self.engine
            .fork_choice(&self.chain)
            .map_err(|e| ChainError::Consensus(e.to_string()))?;
        self.engine
            .update_lib(&self.chain)
            .map_err(|e| ChainError::Consensus(e.to_string()))?;
        Ok(())
    }

    /// Consume `newblock` gossip until `quit` flips.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let block = match Block::decode(&msg.data) {
                        Ok(b) => b,
                        Err(e) => {
                            debug!(from = %msg.from, error = %e, "undecodable block");
                            continue;
                        }
                    };
                    let hash = block.hash();
                    if let Err(e) = self.push_block(block, true).await {
                        debug!(from = %msg.from, %hash, error = %e, "block dropped");
                    }
                }
            }
        }
        debug!("block pool stopped");
    }
}
