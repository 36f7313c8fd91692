//! # PoD Engine
//!
//! Slot-based block production and the consensus rules every block is held
//! to.
//!
//! ## Slots
//!
//! Time is cut into slots of `block_interval_ms`. The dynasty member at
//! index `slot mod |dynasty|` (members in address order) owns a slot. The
//! mint loop wakes every second and mints only inside the window
//! `[next_slot - max_mint_duration, next_slot - min_mint_duration]`,
//! collecting transactions until the slot starts.
//!
//! ```text
//!  slot N                                        slot N+1
//!  |──────────────────────────┬───────────┬──────|
//!                             max         min
//!                             └─ window ──┘
//! ```
//!
//! ## Finality
//!
//! Two paths move the LIB, both through [`Blockchain::set_lib`]:
//!
//! - the walk: from the tail back towards the LIB, the first block by
//!   which `consensus_size` distinct proposers of one dynasty have minted;
//! - witnesses: signed statements from dynasty members that a block is on
//!   their canonical chain. `consensus_size` of them finalise the block.
//!
//! ## Restart safety
//!
//! Every slot we seal a block for is written to a persistable cache before
//! the block is signed. After a restart the journal is replayed, so the
//! same slot is never signed twice.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::dynasty::{serial_of, Dynasty};
use super::{Consensus, ConsensusError, ConsensusResult};
use crate::chain::{AccountStore, Block, BlockPool, Blockchain, ChainError};
use crate::config::{
    ConsensusConfig, DOUBLE_MINT_CACHE_SIZE, DYNASTY_CACHE_SIZE, MINT_TICK, PERSIST_CACHE_INTERVAL,
    VRF_ANCESTOR_DISTANCE,
};
use crate::crypto::{
    blake3_hash, recover_signer, vrf, Address, Hash, Keypair, PublicKey, Signature,
    SignatureAlgorithm,
};
use crate::network::{Broadcaster, InboundMessage, Priority, WITNESS};
use crate::storage::{LruBackend, PersistableCache};
use crate::transaction::{PayloadType, ProtocolPayload, TransactionBuilder};
use crate::util::codec::{decode_u64, encode_u64};

const WITNESS_TAG: &[u8] = b"pod.witness";
const MINT_JOURNAL_CAPACITY: usize = 4_096;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Dynasty provider
// ---------------------------------------------------------------------------

/// On-chain source of dynasties and heartbeat participants.
pub trait DynastyProvider: Send + Sync {
    /// Members of dynasty `serial` as of `parent`, or `None` if the contract
    /// has not produced it yet.
    fn miners(&self, chain: &Blockchain, parent: &Block, serial: u64) -> ConsensusResult<Option<Vec<Address>>>;

    /// Accounts expected to send a heartbeat each dynasty.
    fn participants(&self, chain: &Blockchain, parent: &Block) -> ConsensusResult<Vec<Address>>;
}

/// No dynasty contract: the genesis dynasty carries forward forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContract;

impl DynastyProvider for NoContract {
    fn miners(&self, _: &Blockchain, _: &Block, _: u64) -> ConsensusResult<Option<Vec<Address>>> {
        Ok(None)
    }

    fn participants(&self, _: &Blockchain, _: &Block) -> ConsensusResult<Vec<Address>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Witness
// ---------------------------------------------------------------------------

/// A dynasty member's signed statement that `blocks` are on its canonical
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub proposer: Address,
    pub blocks: Vec<Hash>,
    pub signer: PublicKey,
    pub signature: Signature,
}

impl Witness {
    fn digest(proposer: &Address, blocks: &[Hash]) -> Hash {
        let mut buf = WITNESS_TAG.to_vec();
        buf.extend_from_slice(&proposer.to_bytes());
        for b in blocks {
            buf.extend_from_slice(b.as_bytes());
        }
        blake3_hash(&buf)
    }

    pub fn new(keypair: &Keypair, blocks: Vec<Hash>) -> Self {
        let proposer = keypair.address();
        let digest = Self::digest(&proposer, &blocks);
        Self {
            proposer,
            signature: keypair.sign(digest.as_bytes()),
            signer: keypair.public_key(),
            blocks,
        }
    }

    pub fn verify(&self) -> ConsensusResult<()> {
        let digest = Self::digest(&self.proposer, &self.blocks);
        let addr = recover_signer(
            SignatureAlgorithm::Ed25519,
            &self.signer,
            digest.as_bytes(),
            &self.signature,
        )
        .map_err(|e| ConsensusError::InvalidWitness(e.to_string()))?;
        if addr != self.proposer {
            return Err(ConsensusError::InvalidWitness(format!(
                "signed by {addr}, claims {}",
                self.proposer
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ConsensusError::InvalidWitness(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        bincode::deserialize(bytes).map_err(|e| ConsensusError::InvalidWitness(e.to_string()))
    }
}

/// Strict total order over competing tails: higher wins, then the smaller
/// hash.
pub fn is_better_tail(candidate: &Block, current: &Block) -> bool {
    candidate.height() > current.height()
        || (candidate.height() == current.height() && candidate.hash().less(&current.hash()))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Miner {
    keypair: Keypair,
    coinbase: Address,
}

pub struct PodEngine {
    config: ConsensusConfig,
    chain_id: u32,
    genesis_timestamp: i64,
    genesis_dynasty_root: Hash,
    miner: Option<Miner>,
    provider: Arc<dyn DynastyProvider>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    journal: Option<Arc<PersistableCache<LruBackend>>>,
    enabled: AtomicBool,
    pending: AtomicBool,
    last_heartbeat: AtomicU64,
    dynasties: Mutex<LruCache<u64, Dynasty>>,
    slots: Mutex<LruCache<i64, Hash>>,
    witnesses: DashMap<Hash, (u64, HashSet<Address>)>,
}

impl std::fmt::Debug for PodEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodEngine")
            .field("chain_id", &self.chain_id)
            .field("miner", &self.miner_address())
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl PodEngine {
    pub fn new(config: ConsensusConfig, chain: &Blockchain) -> Self {
        let genesis = chain.genesis();
        let dyn_cap = NonZeroUsize::new(DYNASTY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let slot_cap = NonZeroUsize::new(DOUBLE_MINT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            chain_id: chain.chain_id(),
            genesis_timestamp: genesis.timestamp(),
            genesis_dynasty_root: genesis.header.dynasty_root,
            miner: None,
            provider: Arc::new(NoContract),
            broadcaster: None,
            journal: None,
            enabled: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            last_heartbeat: AtomicU64::new(0),
            dynasties: Mutex::new(LruCache::new(dyn_cap)),
            slots: Mutex::new(LruCache::new(slot_cap)),
            witnesses: DashMap::new(),
        }
    }

    /// Mint with `keypair`. Rewards go to `coinbase`, or to the miner.
    pub fn with_miner(mut self, keypair: Keypair, coinbase: Option<Address>) -> Self {
        let coinbase = coinbase.unwrap_or_else(|| keypair.address());
        self.miner = Some(Miner { keypair, coinbase });
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn DynastyProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Keep the minted-slot journal in `dir`.
    pub fn with_journal(mut self, dir: &Path) -> ConsensusResult<Self> {
        let cache = PersistableCache::open(dir, LruBackend::new(MINT_JOURNAL_CAPACITY))?;
        self.journal = Some(Arc::new(cache));
        Ok(self)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn miner_address(&self) -> Option<Address> {
        self.miner.as_ref().map(|m| m.keypair.address())
    }

    pub fn enable_mint(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable_mint(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_mint_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn slot_secs(&self) -> u64 {
        self.config.block_interval_secs().max(1)
    }

    fn serial_at(&self, timestamp: i64) -> u64 {
        serial_of(timestamp, self.genesis_timestamp, self.config.dynasty_interval_ms)
    }

    // -----------------------------------------------------------------------
    // Dynasties
    // -----------------------------------------------------------------------

    /// Dynasty in force at `timestamp` for a block built on `parent`.
    pub fn dynasty_at(&self, chain: &Blockchain, parent: &Block, timestamp: i64) -> ConsensusResult<Dynasty> {
        let serial = self.serial_at(timestamp);
        if let Some(d) = self.dynasties.lock().get(&serial) {
            return Ok(d.clone());
        }
        let storage = chain.storage().clone();
        let (dynasty, cacheable) = if serial == 0 {
            (Dynasty::load(storage, 0, self.genesis_dynasty_root)?, true)
        } else {
            match self.provider.miners(chain, parent, serial)? {
                Some(members) => (Dynasty::create(storage, serial, &members)?, true),
                // Not produced yet: carry the parent's dynasty forward.
                None => (Dynasty::load(storage, serial, parent.header.dynasty_root)?, false),
            }
        };
        if dynasty.is_empty() {
            return Err(ConsensusError::DynastyNotFound(serial));
        }
        if cacheable {
            self.dynasties.lock().put(serial, dynasty.clone());
        }
        Ok(dynasty)
    }

    /// The dynasty a stored block committed to.
    fn dynasty_of(&self, chain: &Blockchain, block: &Block) -> ConsensusResult<Dynasty> {
        Ok(Dynasty::load(
            chain.storage().clone(),
            self.serial_at(block.timestamp()),
            block.header.dynasty_root,
        )?)
    }

    // -----------------------------------------------------------------------
    // VRF
    // -----------------------------------------------------------------------

    /// `(ancestor hash, parent seed)` for a child of `parent`.
    fn vrf_inputs(&self, chain: &Blockchain, parent: &Arc<Block>) -> ConsensusResult<(Hash, Hash)> {
        let mut ancestor = parent.clone();
        for _ in 1..VRF_ANCESTOR_DISTANCE {
            if ancestor.is_genesis() {
                break;
            }
            ancestor = chain
                .get_block(&ancestor.parent_hash())?
                .ok_or(ChainError::MissingParent(ancestor.parent_hash()))?;
        }
        let parent_seed = parent
            .header
            .random
            .as_ref()
            .map(|r| r.seed)
            .unwrap_or_else(|| parent.hash());
        Ok((ancestor.hash(), parent_seed))
    }

    // -----------------------------------------------------------------------
    // Minting
    // -----------------------------------------------------------------------

    /// Slot to mint (seconds) and the collection deadline (ms) for a tick
    /// at `now_ms`.
    pub fn mint_window(&self, now_ms: i64) -> ConsensusResult<(i64, i64)> {
        let slot_ms = (self.slot_secs() * 1000) as i64;
        let next_slot_ms = if now_ms % slot_ms == 0 {
            now_ms
        } else {
            (now_ms / slot_ms + 1) * slot_ms
        };
        let remaining = next_slot_ms - now_ms;
        if remaining > self.config.max_mint_duration_ms as i64
            || remaining < self.config.min_mint_duration_ms as i64
        {
            return Err(ConsensusError::OutsideMintWindow);
        }
        let deadline = next_slot_ms.min(now_ms + self.config.max_mint_duration_ms as i64);
        Ok((next_slot_ms / 1000, deadline))
    }

    /// Build, seal and sign the block for the slot following `now_ms`.
    /// The block is not pushed anywhere.
    pub async fn mint_block(&self, pool: &BlockPool, now_ms: i64) -> ConsensusResult<Block> {
        if !self.is_mint_enabled() {
            return Err(ConsensusError::MintDisabled);
        }
        if self.is_pending() {
            return Err(ConsensusError::MintPending);
        }
        let miner = self.miner.as_ref().ok_or(ConsensusError::NoMinerKey)?;
        let (slot, deadline_ms) = self.mint_window(now_ms)?;

        let chain = pool.chain();
        let tail = chain.tail();
        if tail.timestamp() >= slot {
            return Err(ConsensusError::SlotOccupied(slot));
        }
        let key = encode_u64(slot as u64);
        if self.journal.as_ref().is_some_and(|j| j.contains(&key)) {
            return Err(ConsensusError::SlotOccupied(slot));
        }

        let dynasty = self.dynasty_at(chain, &tail, slot)?;
        let proposer = dynasty
            .proposer_at(slot, self.slot_secs())
            .ok_or(ConsensusError::DynastyNotFound(dynasty.serial()))?;
        let me = miner.keypair.address();
        if proposer != me {
            return Err(ConsensusError::NotOurTurn);
        }

        let mut block = Block::new(self.chain_id, miner.coinbase, me, &tail, slot);
        block.header.dynasty_root = dynasty.root();
        if block.height() >= self.config.vrf_activation_height {
            let (ancestor, parent_seed) = self.vrf_inputs(chain, &tail)?;
            block.header.random = Some(vrf::evaluate(&miner.keypair, &ancestor, &parent_seed));
        }

        let world = Arc::new(chain.state_at(&tail)?);
        let budget = Duration::from_millis((deadline_ms - now_ms).max(0) as u64);
        let outcome = pool
            .executor()
            .produce(world, pool.tx_pool(), &block, Instant::now() + budget)
            .await?;
        block.transactions = outcome.transactions;
        block.dag = outcome.dag;
        block.seal(outcome.state_root, outcome.events_root)?;

        if let Some(journal) = &self.journal {
            journal.set(&key, block.hash().as_bytes())?;
        }
        block.sign(&miner.keypair)?;
        info!(
            height = block.height(),
            slot,
            txs = block.transactions.len(),
            hash = %block.hash(),
            "minted block"
        );
        Ok(block)
    }

    /// Once per dynasty, send a heartbeat if we are a listed participant.
    pub fn maybe_heartbeat(&self, pool: &BlockPool, now_ms: i64) -> ConsensusResult<bool> {
        let Some(miner) = &self.miner else {
            return Ok(false);
        };
        let serial = self.serial_at(now_ms / 1000);
        if serial == 0 || self.last_heartbeat.load(Ordering::Acquire) >= serial {
            return Ok(false);
        }
        self.last_heartbeat.store(serial, Ordering::Release);

        let chain = pool.chain();
        let tail = chain.tail();
        let me = miner.keypair.address();
        if !self.provider.participants(chain, &tail)?.contains(&me) {
            return Ok(false);
        }
        let nonce = chain.state_at(&tail)?.account(&me)?.nonce + 1;
        let tx = TransactionBuilder::new(self.chain_id, me, me)
            .nonce(nonce)
            .payload(PayloadType::Protocol, ProtocolPayload::Heartbeat { serial }.encode()?)
            .build_signed(&miner.keypair)?;
        pool.tx_pool().push_and_broadcast(tx)?;
        info!(serial, "heartbeat sent");
        Ok(true)
    }

    async fn mint_tick(&self, pool: &BlockPool) {
        let now = now_ms();
        if let Err(e) = self.maybe_heartbeat(pool, now) {
            warn!(error = %e, "heartbeat failed");
        }
        match self.mint_block(pool, now).await {
            Ok(block) => {
                // Hold the block until its slot starts.
                let wait = block.timestamp() * 1000 - now_ms();
                if wait > 0 {
                    tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                }
                let hash = block.hash();
                if let Err(e) = pool.push_local(block).await {
                    warn!(%hash, error = %e, "minted block rejected");
                }
            }
            Err(e) if e.is_idle() => trace!(reason = %e, "no mint"),
            Err(e) => warn!(error = %e, "mint failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Witnesses
    // -----------------------------------------------------------------------

    fn emit_witness(&self, chain: &Blockchain, block: &Block) {
        let (Some(miner), Some(broadcaster)) = (&self.miner, &self.broadcaster) else {
            return;
        };
        match self.dynasty_of(chain, block) {
            Ok(d) if d.contains(&miner.keypair.address()) => {}
            _ => return,
        }
        let witness = Witness::new(&miner.keypair, vec![block.hash()]);
        if let Err(e) = self.handle_witness(chain, &witness) {
            debug!(error = %e, "own witness not recorded");
        }
        match witness.encode() {
            Ok(bytes) => broadcaster.broadcast(WITNESS, bytes, Priority::Normal),
            Err(e) => warn!(error = %e, "witness encode failed"),
        }
    }

    /// Record `witness`. Returns whether the LIB moved.
    pub fn handle_witness(&self, chain: &Blockchain, witness: &Witness) -> ConsensusResult<bool> {
        witness.verify()?;
        let threshold = self.config.consensus_size();
        let mut advanced = false;
        for hash in &witness.blocks {
            let Some(block) = chain.get_block(hash)? else {
                trace!(%hash, "witness for unknown block");
                continue;
            };
            if !chain.is_canonical(&block)? {
                trace!(%hash, "witness for non-canonical block");
                continue;
            }
            if !self.dynasty_of(chain, &block)?.contains(&witness.proposer) {
                return Err(ConsensusError::NotInDynasty(witness.proposer));
            }
            let count = {
                let mut entry = self
                    .witnesses
                    .entry(*hash)
                    .or_insert_with(|| (block.height(), HashSet::new()));
                entry.1.insert(witness.proposer);
                entry.1.len()
            };
            if count >= threshold && chain.set_lib(block.clone())? {
                info!(height = block.height(), %hash, witnesses = count, "LIB by witnesses");
                advanced = true;
            }
        }
        if advanced {
            let lib = chain.lib();
            self.witnesses.retain(|_, (height, _)| *height > lib.height());
            self.prune_journal(&lib);
        }
        Ok(advanced)
    }

    fn on_witness_message(&self, chain: &Blockchain, msg: &InboundMessage) {
        let result = Witness::decode(&msg.data).and_then(|w| self.handle_witness(chain, &w));
        if let Err(e) = result {
            debug!(from = %msg.from, error = %e, "witness dropped");
        }
    }

    /// Mint every tick, handle witnesses as they arrive, rotate the slot
    /// journal, until `quit` flips.
    pub async fn run(
        self: Arc<Self>,
        pool: Arc<BlockPool>,
        mut witnesses: Option<mpsc::Receiver<InboundMessage>>,
        mut quit: watch::Receiver<bool>,
    ) {
        if let Some(journal) = &self.journal {
            tokio::spawn(journal.clone().run(PERSIST_CACHE_INTERVAL, quit.clone()));
        }
        let mut tick = tokio::time::interval(MINT_TICK);
        info!(miner = ?self.miner_address(), enabled = self.is_mint_enabled(), "consensus started");
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = tick.tick() => self.mint_tick(&pool).await,
                Some(msg) = recv_opt(&mut witnesses) => self.on_witness_message(pool.chain(), &msg),
            }
        }
        info!("consensus stopped");
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl PodEngine {
    /// Forget minted slots at or below the LIB; they can never be minted
    /// again anyway.
    fn prune_journal(&self, lib: &Block) {
        let Some(journal) = &self.journal else {
            return;
        };
        let lib_slot = lib.timestamp();
        let pruned = journal.retain(|key, _| decode_u64(key).map_or(true, |slot| slot as i64 > lib_slot));
        match pruned {
            Ok(0) => {}
            Ok(n) => debug!(pruned = n, lib_slot, "mint journal pruned"),
            Err(e) => warn!(error = %e, "mint journal prune failed"),
        }
    }
}

impl Consensus for PodEngine {
    fn verify_block(&self, chain: &Blockchain, block: &Block) -> ConsensusResult<()> {
        let ts = block.timestamp();
        let parent = chain
            .get_block(&block.parent_hash())?
            .ok_or(ChainError::MissingParent(block.parent_hash()))?;
        let slot_secs = self.slot_secs() as i64;
        if ts <= parent.timestamp() || ts % slot_secs != 0 {
            return Err(ConsensusError::InvalidTimestamp(ts));
        }
        if ts * 1000 > now_ms() + self.config.block_interval_ms as i64 {
            return Err(ConsensusError::InvalidTimestamp(ts));
        }

        let dynasty = self.dynasty_at(chain, &parent, ts)?;
        if block.header.dynasty_root != dynasty.root() {
            return Err(ConsensusError::DynastyMismatch(dynasty.serial()));
        }
        let expected = dynasty
            .proposer_at(ts, self.slot_secs())
            .ok_or(ConsensusError::DynastyNotFound(dynasty.serial()))?;
        if block.proposer() != expected {
            return Err(ConsensusError::WrongProposer {
                expected,
                got: block.proposer(),
            });
        }
        block.verify_signature()?;

        if block.height() >= self.config.vrf_activation_height {
            let output = block.header.random.as_ref().ok_or(ConsensusError::MissingVrf)?;
            let signer = block
                .header
                .signer
                .as_ref()
                .ok_or_else(|| ChainError::InvalidBlock("unsigned block".into()))?;
            let (ancestor, parent_seed) = self.vrf_inputs(chain, &parent)?;
            if !vrf::verify(signer, &ancestor, &parent_seed, output) {
                return Err(ConsensusError::InvalidVrf);
            }
        }

        let mut slots = self.slots.lock();
        match slots.get(&ts) {
            Some(first) if *first != block.hash() => {
                warn!(timestamp = ts, first = %first, second = %block.hash(), "double mint");
                Err(ConsensusError::DoubleMint {
                    timestamp: ts,
                    first: *first,
                    second: block.hash(),
                })
            }
            _ => {
                slots.put(ts, block.hash());
                Ok(())
            }
        }
    }

    fn fork_choice(&self, chain: &Blockchain) -> ConsensusResult<Option<Arc<Block>>> {
        let tail = chain.tail();
        let best = chain
            .detached_tails()
            .into_iter()
            .fold(tail.clone(), |best, t| if is_better_tail(&t, &best) { t } else { best });
        if best.hash() == tail.hash() {
            return Ok(None);
        }
        chain.set_tail(best.clone())?;
        self.emit_witness(chain, &best);
        Ok(Some(best))
    }

    fn update_lib(&self, chain: &Blockchain) -> ConsensusResult<bool> {
        let lib = chain.lib();
        let threshold = self.config.consensus_size();
        let mut cur = chain.tail();
        let mut serial = self.serial_at(cur.timestamp());
        let mut proposers: HashSet<Address> = HashSet::new();

        while cur.hash() != lib.hash() && cur.height() > lib.height() {
            let s = self.serial_at(cur.timestamp());
            if s != serial {
                serial = s;
                proposers.clear();
            }
            let remaining = cur.height() - lib.height();
            if remaining < threshold.saturating_sub(proposers.len()) as u64 {
                break;
            }
            proposers.insert(cur.proposer());
            if proposers.len() >= threshold {
                let advanced = chain.set_lib(cur.clone())?;
                if advanced {
                    self.prune_journal(&cur);
                }
                return Ok(advanced);
            }
            cur = chain
                .get_block(&cur.parent_hash())?
                .ok_or(ChainError::MissingParent(cur.parent_hash()))?;
        }
        Ok(false)
    }

    fn suspend_mint(&self) {
        self.pending.store(true, Ordering::Release);
    }

    fn resume_mint(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::blockchain::tests::genesis_config;
    use crate::storage::{MemoryStorage, Storage};

    fn keys() -> Vec<Keypair> {
        let mut ks: Vec<Keypair> = (1..=3u8).map(|i| Keypair::from_seed(&[i; 32])).collect();
        ks.sort_by_key(|k| k.address());
        ks
    }

    fn setup() -> (Arc<Blockchain>, PodEngine, Vec<Keypair>) {
        let ks = keys();
        let dynasty: Vec<Address> = ks.iter().map(|k| k.address()).collect();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let chain = Arc::new(Blockchain::open(storage, &genesis_config(&dynasty, &[])).unwrap());
        let config = ConsensusConfig {
            dynasty_size: 3,
            ..ConsensusConfig::default()
        };
        let engine = PodEngine::new(config, &chain);
        (chain, engine, ks)
    }

    /// A signed, empty child of `parent` at `ts`, with VRF if required.
    fn child(engine: &PodEngine, chain: &Blockchain, parent: &Arc<Block>, ts: i64, kp: &Keypair) -> Block {
        let mut b = Block::new(chain.chain_id(), kp.address(), kp.address(), parent, ts);
        if b.height() >= engine.config.vrf_activation_height {
            let (a, s) = engine.vrf_inputs(chain, parent).unwrap();
            b.header.random = Some(vrf::evaluate(kp, &a, &s));
        }
        b.seal(parent.header.state_root, Hash::ZERO).unwrap();
        b.sign(kp).unwrap();
        b
    }

    /// Owner of the slot at `ts`.
    fn owner<'a>(ks: &'a [Keypair], ts: i64) -> &'a Keypair {
        &ks[(ts as usize / 15) % ks.len()]
    }

    #[test]
    fn mint_window_bounds() {
        let (_, engine, _) = setup();
        // 15 s slots, window is 5.25 s .. 2.25 s before the boundary.
        assert!(matches!(engine.mint_window(9_000), Err(ConsensusError::OutsideMintWindow)));
        assert_eq!(engine.mint_window(9_750).unwrap(), (15, 15_000));
        assert_eq!(engine.mint_window(11_000).unwrap(), (15, 15_000));
        assert_eq!(engine.mint_window(12_750).unwrap(), (15, 15_000));
        assert!(matches!(engine.mint_window(13_000), Err(ConsensusError::OutsideMintWindow)));
        assert!(matches!(engine.mint_window(15_000), Err(ConsensusError::OutsideMintWindow)));
    }

    #[test]
    fn well_formed_block_verifies() {
        let (chain, engine, ks) = setup();
        let g = chain.genesis();
        let b = child(&engine, &chain, &g, 15, owner(&ks, 15));
        engine.verify_block(&chain, &b).unwrap();
        // Seeing the same block twice is not a double mint.
        engine.verify_block(&chain, &b).unwrap();
    }

    #[test]
    fn rule_violations_are_rejected() {
        let (chain, engine, ks) = setup();
        let g = chain.genesis();

        let misaligned = child(&engine, &chain, &g, 16, owner(&ks, 15));
        assert!(matches!(
            engine.verify_block(&chain, &misaligned),
            Err(ConsensusError::InvalidTimestamp(16))
        ));

        let intruder = owner(&ks, 30);
        let wrong = child(&engine, &chain, &g, 15, intruder);
        assert!(matches!(
            engine.verify_block(&chain, &wrong),
            Err(ConsensusError::WrongProposer { .. })
        ));

        let kp = owner(&ks, 15);
        let mut no_vrf = Block::new(chain.chain_id(), kp.address(), kp.address(), &g, 15);
        no_vrf.seal(g.header.state_root, Hash::ZERO).unwrap();
        no_vrf.sign(kp).unwrap();
        assert!(matches!(
            engine.verify_block(&chain, &no_vrf),
            Err(ConsensusError::MissingVrf)
        ));
    }

    #[test]
    fn second_block_in_a_slot_is_a_double_mint() {
        let (chain, engine, ks) = setup();
        let g = chain.genesis();
        let kp = owner(&ks, 15);
        let first = child(&engine, &chain, &g, 15, kp);
        engine.verify_block(&chain, &first).unwrap();

        let mut second = Block::new(chain.chain_id(), Address::null(), kp.address(), &g, 15);
        let (a, s) = engine.vrf_inputs(&chain, &g).unwrap();
        second.header.random = Some(vrf::evaluate(kp, &a, &s));
        second.seal(g.header.state_root, Hash::ZERO).unwrap();
        second.sign(kp).unwrap();
        assert!(matches!(
            engine.verify_block(&chain, &second),
            Err(ConsensusError::DoubleMint { timestamp: 15, .. })
        ));
    }

    #[test]
    fn fork_choice_prefers_height_then_smaller_hash() {
        let (chain, engine, ks) = setup();
        let g = chain.genesis();
        let a = Arc::new(child(&engine, &chain, &g, 15, owner(&ks, 15)));
        let b = Arc::new(child(&engine, &chain, &g, 30, owner(&ks, 30)));
        chain.store_block(a.clone()).unwrap();
        chain.store_block(b.clone()).unwrap();

        let picked = engine.fork_choice(&chain).unwrap().unwrap();
        let expected = if a.hash().less(&b.hash()) { &a } else { &b };
        assert_eq!(picked.hash(), expected.hash());
        assert!(engine.fork_choice(&chain).unwrap().is_none());

        let c = Arc::new(child(&engine, &chain, &b, 45, owner(&ks, 45)));
        chain.store_block(c.clone()).unwrap();
        assert_eq!(engine.fork_choice(&chain).unwrap().unwrap().hash(), c.hash());
    }

    #[test]
    fn lib_follows_distinct_proposers() {
        let (chain, engine, ks) = setup();
        let mut parent = chain.genesis();
        let mut blocks = Vec::new();
        for ts in [15, 30] {
            let b = Arc::new(child(&engine, &chain, &parent, ts, owner(&ks, ts)));
            chain.store_block(b.clone()).unwrap();
            blocks.push(b.clone());
            parent = b;
        }
        engine.fork_choice(&chain).unwrap();
        // Two proposers out of a consensus size of three.
        assert!(!engine.update_lib(&chain).unwrap());

        let b = Arc::new(child(&engine, &chain, &parent, 45, owner(&ks, 45)));
        chain.store_block(b).unwrap();
        engine.fork_choice(&chain).unwrap();
        assert!(engine.update_lib(&chain).unwrap());
        assert_eq!(chain.lib().hash(), blocks[0].hash());
        assert!(!engine.update_lib(&chain).unwrap());
    }

    #[test]
    fn lib_prunes_the_mint_journal() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, engine, ks) = setup();
        let engine = engine.with_journal(dir.path()).unwrap();
        let journal = engine.journal.clone().unwrap();
        for slot in [15u64, 30, 45] {
            journal.set(&encode_u64(slot), b"minted").unwrap();
        }

        let mut parent = chain.genesis();
        let mut blocks = Vec::new();
        for ts in [15, 30, 45] {
            let b = Arc::new(child(&engine, &chain, &parent, ts, owner(&ks, ts)));
            chain.store_block(b.clone()).unwrap();
            blocks.push(b.clone());
            parent = b;
        }
        engine.fork_choice(&chain).unwrap();
        assert!(engine.update_lib(&chain).unwrap());
        assert_eq!(chain.lib().hash(), blocks[0].hash());

        assert!(!journal.contains(&encode_u64(15)));
        assert!(journal.contains(&encode_u64(30)));
        assert!(journal.contains(&encode_u64(45)));
    }

    #[test]
    fn witnesses_finalise_a_block() {
        let (chain, engine, ks) = setup();
        let g = chain.genesis();
        let b = Arc::new(child(&engine, &chain, &g, 15, owner(&ks, 15)));
        chain.store_block(b.clone()).unwrap();
        engine.fork_choice(&chain).unwrap();

        for (i, kp) in ks.iter().enumerate() {
            let advanced = engine
                .handle_witness(&chain, &Witness::new(kp, vec![b.hash()]))
                .unwrap();
            assert_eq!(advanced, i == ks.len() - 1);
        }
        assert_eq!(chain.lib().hash(), b.hash());

        let outsider = Keypair::from_seed(&[9; 32]);
        let c = Arc::new(child(&engine, &chain, &b, 30, owner(&ks, 30)));
        chain.store_block(c.clone()).unwrap();
        engine.fork_choice(&chain).unwrap();
        assert!(matches!(
            engine.handle_witness(&chain, &Witness::new(&outsider, vec![c.hash()])),
            Err(ConsensusError::NotInDynasty(_))
        ));
    }

    #[test]
    fn tampered_witness_fails_verification() {
        let kp = Keypair::from_seed(&[4; 32]);
        let mut w = Witness::new(&kp, vec![blake3_hash(b"block")]);
        w.verify().unwrap();
        w.blocks.push(blake3_hash(b"other"));
        assert!(w.verify().is_err());
        let back = Witness::decode(&Witness::new(&kp, vec![]).encode().unwrap()).unwrap();
        back.verify().unwrap();
    }

    #[test]
    fn contract_dynasty_replaces_the_fallback() {
        struct Rotate(Vec<Address>);
        impl DynastyProvider for Rotate {
            fn miners(&self, _: &Blockchain, _: &Block, _: u64) -> ConsensusResult<Option<Vec<Address>>> {
                Ok(Some(self.0.clone()))
            }
            fn participants(&self, _: &Blockchain, _: &Block) -> ConsensusResult<Vec<Address>> {
                Ok(self.0.clone())
            }
        }

        let (chain, engine, ks) = setup();
        let g = chain.genesis();
        let fallback = engine.dynasty_at(&chain, &g, 3_600).unwrap();
        assert_eq!(fallback.root(), g.header.dynasty_root);
        assert_eq!(fallback.serial(), 1);

        let next = vec![ks[0].address()];
        let engine = engine.with_provider(Arc::new(Rotate(next.clone())));
        // Serial 1 was never cached, so the contract answer is used.
        let d = engine.dynasty_at(&chain, &g, 3_600).unwrap();
        assert_eq!(d.members(), next.as_slice());
        assert_ne!(d.root(), g.header.dynasty_root);
    }
}
