//! # Blockchain
//!
//! Block storage, the canonical height index, the tail and the latest
//! irreversible block.
//!
//! ## Storage Layout
//!
//! ```text
//! "blk:" ‖ hash        → encoded block
//! "hgt:" ‖ height (BE) → hash of the canonical block at that height
//! "blockchain_tail"    → hash of the tail
//! "blockchain_lib"     → hash of the LIB
//! <32-byte hash>       → trie nodes (state, dynasty)
//! ```
//!
//! Only the [`BlockPool`](super::BlockPool) writes here. Everyone else reads
//! the tail and LIB through cheap `Arc` snapshots.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use serde_json::json;
use tracing::{debug, info, warn};

use super::block::{Block, BlockHeader};
use super::events::{Event, EventBus, TOPIC_LIB_BLOCK, TOPIC_NEW_TAIL_BLOCK, TOPIC_REVERT_BLOCK};
use super::world_state::{AccountStore, WorldState};
use super::{ChainError, ChainResult};
use crate::config::{GenesisConfig, BLOCK_CACHE_SIZE, GENESIS_HEIGHT};
use crate::consensus::dynasty::Dynasty;
use crate::crypto::{Address, Hash, Signature, SignatureAlgorithm};
use crate::storage::{get_opt, Storage};
use crate::transaction::AccountNonces;
use crate::util::codec::encode_u64;
use crate::util::Dag;

const BLOCK_PREFIX: &[u8] = b"blk:";
const HEIGHT_PREFIX: &[u8] = b"hgt:";
const TAIL_KEY: &[u8] = b"blockchain_tail";
const LIB_KEY: &[u8] = b"blockchain_lib";

fn block_key(hash: &Hash) -> Vec<u8> {
    [BLOCK_PREFIX, hash.as_bytes()].concat()
}

fn height_key(height: u64) -> Vec<u8> {
    [HEIGHT_PREFIX, &encode_u64(height)[..]].concat()
}

pub struct Blockchain {
    chain_id: u32,
    storage: Arc<dyn Storage>,
    genesis: Arc<Block>,
    tail: RwLock<Arc<Block>>,
    lib: RwLock<Arc<Block>>,
    detached_tails: Mutex<HashMap<Hash, Arc<Block>>>,
    cache: Mutex<LruCache<Hash, Arc<Block>>>,
    events: EventBus,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("chain_id", &self.chain_id)
            .field("tail", &self.tail.read().height())
            .field("lib", &self.lib.read().height())
            .finish()
    }
}

impl Blockchain {
    /// Open the chain over `storage`, creating the genesis block on first
    /// use. A stored genesis that differs from `genesis` is refused.
    pub fn open(storage: Arc<dyn Storage>, genesis: &GenesisConfig) -> ChainResult<Self> {
        let block = Arc::new(build_genesis(storage.clone(), genesis)?);
        let cap = NonZeroUsize::new(BLOCK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        let chain = Self {
            chain_id: genesis.chain_id,
            storage,
            genesis: block.clone(),
            tail: RwLock::new(block.clone()),
            lib: RwLock::new(block.clone()),
            detached_tails: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(cap)),
            events: EventBus::new(),
        };

        match chain.hash_at_height(GENESIS_HEIGHT)? {
            Some(stored) if stored != block.hash() => {
                return Err(ChainError::InvalidBlock(format!(
                    "stored genesis {stored} does not match configured genesis {}",
                    block.hash()
                )));
            }
            Some(_) => {}
            None => {
                chain.put_block(&block)?;
                chain.storage.put(&height_key(GENESIS_HEIGHT), block.hash().as_bytes())?;
                chain.storage.put(TAIL_KEY, block.hash().as_bytes())?;
                chain.storage.put(LIB_KEY, block.hash().as_bytes())?;
                info!(hash = %block.hash(), "created genesis block");
            }
        }

        let tail = chain.load_pointer(TAIL_KEY)?.unwrap_or_else(|| block.clone());
        let lib = chain.load_pointer(LIB_KEY)?.unwrap_or_else(|| block.clone());
        info!(tail = tail.height(), lib = lib.height(), "chain opened");
        chain.detached_tails.lock().insert(tail.hash(), tail.clone());
        *chain.tail.write() = tail;
        *chain.lib.write() = lib;
        Ok(chain)
    }

    fn load_pointer(&self, key: &[u8]) -> ChainResult<Option<Arc<Block>>> {
        let Some(bytes) = get_opt(self.storage.as_ref(), key)? else {
            return Ok(None);
        };
        let hash = Hash::from_slice(&bytes).map_err(|e| ChainError::Codec(e.to_string()))?;
        self.get_block(&hash)?
            .map(Some)
            .ok_or(ChainError::BlockNotFound(hash))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn genesis(&self) -> Arc<Block> {
        self.genesis.clone()
    }

    pub fn tail(&self) -> Arc<Block> {
        self.tail.read().clone()
    }

    pub fn lib(&self) -> Arc<Block> {
        self.lib.read().clone()
    }

    pub fn detached_tails(&self) -> Vec<Arc<Block>> {
        self.detached_tails.lock().values().cloned().collect()
    }

    /// State after `block`.
    pub fn state_at(&self, block: &Block) -> ChainResult<WorldState> {
        WorldState::at(self.storage.clone(), block.header.state_root)
    }

    pub fn tail_state(&self) -> ChainResult<WorldState> {
        self.state_at(&self.tail())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    pub fn get_block(&self, hash: &Hash) -> ChainResult<Option<Arc<Block>>> {
        if let Some(b) = self.cache.lock().get(hash) {
            return Ok(Some(b.clone()));
        }
        let Some(bytes) = get_opt(self.storage.as_ref(), &block_key(hash))? else {
            return Ok(None);
        };
        let block = Arc::new(Block::decode(&bytes)?);
        self.cache.lock().put(*hash, block.clone());
        Ok(Some(block))
    }

    pub fn contains(&self, hash: &Hash) -> ChainResult<bool> {
        if self.cache.lock().contains(hash) {
            return Ok(true);
        }
        Ok(get_opt(self.storage.as_ref(), &block_key(hash))?.is_some())
    }

    pub fn hash_at_height(&self, height: u64) -> ChainResult<Option<Hash>> {
        get_opt(self.storage.as_ref(), &height_key(height))?
            .map(|b| Hash::from_slice(&b).map_err(|e| ChainError::Codec(e.to_string())))
            .transpose()
    }

    /// Canonical block at `height`.
    pub fn block_at_height(&self, height: u64) -> ChainResult<Option<Arc<Block>>> {
        match self.hash_at_height(height)? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn is_canonical(&self, block: &Block) -> ChainResult<bool> {
        Ok(self.hash_at_height(block.height())? == Some(block.hash()))
    }

    /// Whether `ancestor` lies on the parent chain of `block` (or is it).
    pub fn is_descendant(&self, ancestor: &Block, block: &Block) -> ChainResult<bool> {
        let mut cur = Arc::new(block.clone());
        while cur.height() > ancestor.height() {
            cur = self
                .get_block(&cur.parent_hash())?
                .ok_or(ChainError::MissingParent(cur.parent_hash()))?;
        }
        Ok(cur.hash() == ancestor.hash())
    }

    pub fn common_ancestor(&self, a: &Arc<Block>, b: &Arc<Block>) -> ChainResult<Arc<Block>> {
        let (mut a, mut b) = (a.clone(), b.clone());
        while a.hash() != b.hash() {
            if a.height() >= b.height() {
                a = self.parent_of(&a)?;
            } else {
                b = self.parent_of(&b)?;
            }
        }
        Ok(a)
    }

    fn parent_of(&self, block: &Block) -> ChainResult<Arc<Block>> {
        if block.is_genesis() {
            return Err(ChainError::BlockNotFound(block.parent_hash()));
        }
        self.get_block(&block.parent_hash())?
            .ok_or(ChainError::MissingParent(block.parent_hash()))
    }

    /// Up to `count` canonical blocks right after `after`, in height order.
    /// `after` must itself be canonical.
    pub fn canonical_after(&self, after: &Hash, count: usize) -> ChainResult<Vec<Arc<Block>>> {
        let start = self
            .get_block(after)?
            .ok_or(ChainError::BlockNotFound(*after))?;
        if !self.is_canonical(&start)? {
            return Err(ChainError::InvalidBlock(format!("{after} is not canonical")));
        }
        let tail = self.tail().height();
        let mut out = Vec::with_capacity(count);
        let mut height = start.height() + 1;
        while out.len() < count && height <= tail {
            match self.block_at_height(height)? {
                Some(b) => out.push(b),
                None => break,
            }
            height += 1;
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Writes (block pool only)
    // -----------------------------------------------------------------------

    fn put_block(&self, block: &Arc<Block>) -> ChainResult<()> {
        self.storage.put(&block_key(&block.hash()), &block.encode()?)?;
        self.cache.lock().put(block.hash(), block.clone());
        Ok(())
    }

    /// Persist a verified and executed block and make it a detached tail.
    pub fn store_block(&self, block: Arc<Block>) -> ChainResult<()> {
        self.put_block(&block)?;
        let mut tails = self.detached_tails.lock();
        tails.remove(&block.parent_hash());
        tails.insert(block.hash(), block.clone());
        debug!(height = block.height(), hash = %block.hash(), "block stored");
        Ok(())
    }

    /// Switch the canonical chain to end at `new_tail`.
    ///
    /// Heights from the fork point up are re-indexed and anything above the
    /// new tail is unindexed. Blocks leaving the canonical chain are
    /// announced on the revert topic.
    pub fn set_tail(&self, new_tail: Arc<Block>) -> ChainResult<()> {
        let old_tail = self.tail();
        if old_tail.hash() == new_tail.hash() {
            return Ok(());
        }
        let ancestor = self.common_ancestor(&old_tail, &new_tail)?;

        let mut reverted = Vec::new();
        let mut cur = old_tail.clone();
        while cur.hash() != ancestor.hash() {
            reverted.push(cur.clone());
            cur = self.parent_of(&cur)?;
        }

        let mut branch = Vec::new();
        let mut cur = new_tail.clone();
        while cur.hash() != ancestor.hash() {
            branch.push(cur.clone());
            cur = self.parent_of(&cur)?;
        }

        let mut batch = self.storage.enable_batch();
        for b in branch.iter().rev() {
            batch.put(&height_key(b.height()), b.hash().as_bytes());
        }
        for h in new_tail.height() + 1..=old_tail.height() {
            batch.del(&height_key(h));
        }
        batch.put(TAIL_KEY, new_tail.hash().as_bytes());
        let written = self.storage.flush(&mut batch);
        self.storage.disable_batch(batch);
        written?;

        *self.tail.write() = new_tail.clone();

        for b in &reverted {
            warn!(height = b.height(), hash = %b.hash(), "block reverted");
            self.events.publish(Event::new(TOPIC_REVERT_BLOCK, block_json(b)));
        }
        info!(
            height = new_tail.height(),
            hash = %new_tail.hash(),
            reverted = reverted.len(),
            "new tail"
        );
        self.events
            .publish(Event::new(TOPIC_NEW_TAIL_BLOCK, block_json(&new_tail)));
        Ok(())
    }

    /// Advance the LIB. Lower or equal heights are ignored so the LIB
    /// never moves backwards. The hash is persisted before the event goes
    /// out.
    pub fn set_lib(&self, block: Arc<Block>) -> ChainResult<bool> {
        if block.height() <= self.lib().height() {
            return Ok(false);
        }
        self.storage.put(LIB_KEY, block.hash().as_bytes())?;
        *self.lib.write() = block.clone();

        let height = block.height();
        {
            let mut tails = self.detached_tails.lock();
            tails.retain(|_, t| t.height() > height);
            if tails.is_empty() {
                let tail = self.tail();
                tails.insert(tail.hash(), tail);
            }
        }

        info!(height, hash = %block.hash(), "new LIB");
        self.events.publish(Event::new(TOPIC_LIB_BLOCK, block_json(&block)));
        Ok(true)
    }
}

fn block_json(block: &Block) -> String {
    json!({
        "hash": block.hash().to_hex(),
        "height": block.height(),
        "timestamp": block.timestamp(),
    })
    .to_string()
}

impl AccountNonces for Blockchain {
    fn committed_nonce(&self, address: &Address) -> u64 {
        self.tail_state()
            .and_then(|s| s.account(address))
            .map(|a| a.nonce)
            .unwrap_or(0)
    }
}

fn build_genesis(storage: Arc<dyn Storage>, genesis: &GenesisConfig) -> ChainResult<Block> {
    let world = WorldState::new(storage.clone());
    world.begin()?;
    for alloc in &genesis.distribution {
        let value = U256::from_dec_str(&alloc.value)
            .map_err(|e| ChainError::InvalidBlock(format!("genesis value {}: {e:?}", alloc.value)))?;
        world.add_balance(&alloc.address, value)?;
    }
    let state_root = world.commit()?;
    let dynasty = Dynasty::create(storage, 0, &genesis.dynasty)?;

    let mut block = Block {
        header: BlockHeader {
            hash: Hash::ZERO,
            parent_hash: Hash::ZERO,
            height: GENESIS_HEIGHT,
            timestamp: genesis.timestamp as i64,
            chain_id: genesis.chain_id,
            coinbase: Address::null(),
            proposer: Address::null(),
            state_root: Hash::ZERO,
            txs_root: Hash::ZERO,
            events_root: Hash::ZERO,
            dynasty_root: dynasty.root(),
            random: None,
            alg: SignatureAlgorithm::Ed25519,
            signer: None,
            signature: Signature::default(),
        },
        transactions: Vec::new(),
        dag: Dag::new(),
    };
    block.seal(state_root, Hash::ZERO)?;
    Ok(block)
}
