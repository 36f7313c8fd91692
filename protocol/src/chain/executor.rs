//! # Block Executor
//!
//! Runs a block's transactions against a [`WorldState`] in parallel.
//!
//! ## Architecture
//!
//! ```text
//!  mint side (produce)                       verify side (apply_block)
//!  ───────────────────                       ─────────────────────────
//!  TxPool::pop_excluding(busy senders)       Dispatcher over block.dag
//!        │                                          │
//!  prepare(tid = tx hash)                     prepare(tid = tx hash)
//!  execute on spawn_blocking                  execute
//!  check_and_update ─► deps ─► DAG edges      check_and_update ─► deps
//!        │  conflict: reset and retry                │  dep ∉ ancestors: invalid
//!        ▼                                          ▼
//!  credit coinbase, commit ─► state root      credit coinbase, commit, compare
//! ```
//!
//! Each transaction runs in its own MVCC child keyed by its hash. The
//! dependencies returned by a merge are the transactions whose writes it
//! read, so they become DAG edges on the mint side and must already be DAG
//! ancestors on the verify side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::block::{events_root, Block};
use super::events::{Event, TOPIC_TRANSACTION_RESULT};
use super::world_state::{AccountStore, TxState, WorldState};
use super::{ChainError, ChainResult};
use crate::crypto::{Address, Hash};
use crate::mvcc::Tid;
use crate::transaction::{PayloadType, ProtocolPayload, Transaction, TxError, TxPool};
use crate::util::{Dag, DispatchError, Dispatcher};

// ---------------------------------------------------------------------------
// VM seam
// ---------------------------------------------------------------------------

/// Block-level values a transaction may observe.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: i64,
    pub coinbase: Address,
}

impl BlockContext {
    pub fn of(block: &Block) -> Self {
        Self {
            height: block.height(),
            timestamp: block.timestamp(),
            coinbase: block.header.coinbase,
        }
    }
}

/// Evaluates `deploy`, `call` and `vote` payloads. Must be deterministic:
/// the same transaction against the same state gives the same result.
pub trait Vm: Send + Sync {
    /// Run the payload and return the gas it used on top of the intrinsic
    /// gas. An `Err` fails the transaction; its gas is still charged.
    fn execute(&self, tx: &Transaction, state: &TxState, ctx: &BlockContext) -> Result<u64, String>;
}

/// Rejects every contract payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVm;

impl Vm for NoVm {
    fn execute(&self, tx: &Transaction, _: &TxState, _: &BlockContext) -> Result<u64, String> {
        Err(format!("no vm for {} payloads", tx.payload_type))
    }
}

// ---------------------------------------------------------------------------
// Single transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub success: bool,
    pub gas_used: u64,
    pub fee: U256,
    pub events: Vec<Event>,
}

/// Execute `tx` inside its MVCC view.
///
/// `Err` means the transaction cannot be included at all (bad nonce, cannot
/// pay). A failing payload is not an error: it yields a receipt with
/// `success == false`, the fee taken and the nonce consumed.
pub fn execute_transaction(
    tx: &Transaction,
    state: &TxState,
    vm: &dyn Vm,
    ctx: &BlockContext,
) -> ChainResult<Receipt> {
    let mut sender = state.account(&tx.from)?;
    let expected = sender.nonce + 1;
    if tx.nonce < expected {
        return Err(TxError::NonceTooLow {
            committed: sender.nonce,
            got: tx.nonce,
        }
        .into());
    }
    if tx.nonce > expected {
        return Err(TxError::NonceTooHigh {
            expected,
            got: tx.nonce,
        }
        .into());
    }
    let max_cost = tx.max_cost().ok_or(TxError::InsufficientBalance)?;
    if sender.balance < max_cost {
        return Err(TxError::InsufficientBalance.into());
    }

    sender.nonce = tx.nonce;
    state.put_account(&tx.from, &sender)?;

    let intrinsic = tx.intrinsic_gas();
    let (success, extra_gas, error) = match run_payload(tx, state, vm, ctx) {
        Ok(gas) => (true, gas, None),
        Err(e) => (false, 0, Some(e)),
    };
    let gas_limit = tx.gas_limit.low_u64();
    let gas_used = intrinsic.saturating_add(extra_gas).min(gas_limit);
    let fee = tx.gas_price * U256::from(gas_used);
    state.sub_balance(&tx.from, fee)?;

    let data = json!({
        "hash": tx.hash.to_hex(),
        "status": u8::from(success),
        "gas_used": gas_used.to_string(),
        "error": error.unwrap_or_default(),
    });
    Ok(Receipt {
        tx_hash: tx.hash,
        success,
        gas_used,
        fee,
        events: vec![Event::new(TOPIC_TRANSACTION_RESULT, data.to_string())],
    })
}

/// Value transfer plus payload. The value only moves if the payload
/// succeeds; on failure both accounts are put back.
fn run_payload(
    tx: &Transaction,
    state: &TxState,
    vm: &dyn Vm,
    ctx: &BlockContext,
) -> Result<u64, String> {
    let snapshot = (state.account(&tx.from), state.account(&tx.to));
    let result = (|| {
        let gas = match tx.payload_type {
            PayloadType::Binary => 0,
            PayloadType::Protocol => {
                match ProtocolPayload::decode(&tx.payload).map_err(|e| e.to_string())? {
                    ProtocolPayload::Heartbeat { serial } => {
                        trace!(from = %tx.from, serial, "heartbeat");
                    }
                }
                0
            }
            PayloadType::Deploy | PayloadType::Call | PayloadType::Vote => {
                vm.execute(tx, state, ctx)?
            }
        };
        state
            .sub_balance(&tx.from, tx.value)
            .map_err(|e| e.to_string())?;
        state.add_balance(&tx.to, tx.value).map_err(|e| e.to_string())?;
        Ok(gas)
    })();
    if result.is_err() {
        if let (Ok(from), Ok(to)) = snapshot {
            let _ = state.put_account(&tx.to, &to);
            let _ = state.put_account(&tx.from, &from);
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Result of executing a block body.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    pub transactions: Vec<Transaction>,
    pub dag: Dag<Hash>,
    pub receipts: HashMap<Hash, Receipt>,
    pub state_root: Hash,
    pub events_root: Hash,
}

impl ExecutionOutcome {
    fn total_fees(&self) -> U256 {
        self.receipts
            .values()
            .fold(U256::zero(), |acc, r| acc.saturating_add(r.fee))
    }

    fn events_root(&self) -> ChainResult<Hash> {
        events_root(self.receipts.iter().map(|(h, r)| (h, &r.events)))
    }
}

#[derive(Clone)]
pub struct Executor {
    concurrency: usize,
    block_reward: U256,
    vm: Arc<dyn Vm>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("concurrency", &self.concurrency)
            .field("block_reward", &self.block_reward)
            .finish()
    }
}

fn tid_of(hash: &Hash) -> Tid {
    Tid::from(*hash)
}

fn hash_of(tid: &Tid) -> Option<Hash> {
    Hash::from_slice(tid.as_bytes()).ok()
}

impl Executor {
    pub fn new(concurrency: usize, block_reward: U256) -> Self {
        Self {
            concurrency: concurrency.max(1),
            block_reward,
            vm: Arc::new(NoVm),
        }
    }

    pub fn with_vm(mut self, vm: Arc<dyn Vm>) -> Self {
        self.vm = vm;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fill `block` from `pool` until `deadline`, executing in parallel on
    /// top of `world` (the parent state). Returns the outcome; the caller
    /// copies transactions and DAG into the block and seals it.
    pub async fn produce(
        &self,
        world: Arc<WorldState>,
        pool: &TxPool,
        block: &Block,
        deadline: Instant,
    ) -> ChainResult<ExecutionOutcome> {
        world.begin()?;
        match self.collect(world.clone(), pool, BlockContext::of(block), deadline).await {
            Ok(mut outcome) => {
                self.finish(&world, block.header.coinbase, &mut outcome)?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = world.rollback();
                Err(e)
            }
        }
    }

    async fn collect(
        &self,
        world: Arc<WorldState>,
        pool: &TxPool,
        ctx: BlockContext,
        deadline: Instant,
    ) -> ChainResult<ExecutionOutcome> {
        type TaskOutput = (Arc<Transaction>, ChainResult<Receipt>);

        let mut outcome = ExecutionOutcome::default();
        let mut inflight: JoinSet<TaskOutput> = JoinSet::new();
        let mut busy: HashSet<Address> = HashSet::new();
        let mut give_back: Vec<Arc<Transaction>> = Vec::new();
        let mut retry: Vec<Arc<Transaction>> = Vec::new();

        let spawn = |inflight: &mut JoinSet<TaskOutput>, tx: Arc<Transaction>| {
            let world = world.clone();
            let vm = self.vm.clone();
            inflight.spawn_blocking(move || {
                let res = world
                    .prepare(tid_of(&tx.hash))
                    .and_then(|state| execute_transaction(&tx, &state, vm.as_ref(), &ctx));
                (tx, res)
            });
        };

        loop {
            while inflight.len() < self.concurrency && Instant::now() < deadline {
                let next = match retry.pop() {
                    Some(tx) => Some(tx),
                    None => pool.pop_excluding(&busy),
                };
                let Some(tx) = next else { break };
                busy.insert(tx.from);
                spawn(&mut inflight, tx);
            }
            if inflight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = inflight.join_next() => joined,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            let Some(joined) = joined else { break };
            let (tx, res) = joined.map_err(|e| ChainError::Execution(e.to_string()))?;
            let tid = tid_of(&tx.hash);

            match res {
                Ok(receipt) => match world.check_and_update(&tid) {
                    Ok(deps) => {
                        busy.remove(&tx.from);
                        outcome.dag.add_node(tx.hash).map_err(dag_error)?;
                        for dep in deps.iter().filter_map(hash_of) {
                            if outcome.dag.contains(&dep) {
                                outcome.dag.add_edge(&dep, &tx.hash).map_err(dag_error)?;
                            }
                        }
                        outcome.receipts.insert(tx.hash, receipt);
                        outcome.transactions.push((*tx).clone());
                    }
                    Err(ChainError::Mvcc(e)) if e.is_conflict() => {
                        trace!(tx = %tx.hash, "conflict, retrying");
                        world.reset(&tid)?;
                        retry.push(tx);
                    }
                    Err(e) => return Err(e),
                },
                Err(ChainError::Tx(TxError::NonceTooHigh { .. })) => {
                    discard(&world, &tid);
                    busy.remove(&tx.from);
                    give_back.push(tx);
                }
                Err(e) => {
                    debug!(tx = %tx.hash, error = %e, "dropping unexecutable transaction");
                    discard(&world, &tid);
                    busy.remove(&tx.from);
                }
            }
        }

        // Past the deadline: whatever is still running goes back to the pool.
        while let Some(joined) = inflight.join_next().await {
            if let Ok((tx, _)) = joined {
                discard(&world, &tid_of(&tx.hash));
                give_back.push(tx);
            }
        }
        give_back.append(&mut retry);
        for tx in give_back {
            pool.push_back(tx);
        }
        Ok(outcome)
    }

    /// Replay `block` on top of `world` (its parent state) and check the
    /// result against the header. On any mismatch the state is rolled back.
    pub async fn apply_block(&self, world: Arc<WorldState>, block: &Block) -> ChainResult<()> {
        world.begin()?;
        let result = self.replay(world.clone(), block).await.and_then(|mut outcome| {
            self.finish(&world, block.header.coinbase, &mut outcome)?;
            Ok(outcome)
        });
        let outcome = match result {
            Ok(o) => o,
            Err(e) => {
                let _ = world.rollback();
                return Err(e);
            }
        };
        if outcome.events_root != block.header.events_root {
            return Err(ChainError::InvalidBlock(format!(
                "events root {} != header {}",
                outcome.events_root, block.header.events_root
            )));
        }
        if outcome.state_root != block.header.state_root {
            return Err(ChainError::InvalidBlock(format!(
                "state root {} != header {}",
                outcome.state_root, block.header.state_root
            )));
        }
        Ok(())
    }

    async fn replay(&self, world: Arc<WorldState>, block: &Block) -> ChainResult<ExecutionOutcome> {
        let dag = Arc::new(block.dag.clone());
        let txs: Arc<HashMap<Hash, Transaction>> = Arc::new(
            block
                .transactions
                .iter()
                .map(|tx| (tx.hash, tx.clone()))
                .collect(),
        );
        let receipts: Arc<Mutex<HashMap<Hash, Receipt>>> = Arc::new(Mutex::new(HashMap::new()));
        let ctx = BlockContext::of(block);

        let callback = {
            let dag = dag.clone();
            let txs = txs.clone();
            let receipts = receipts.clone();
            let vm = self.vm.clone();
            move |index: usize, key: &Hash| -> ChainResult<()> {
                let tx = txs
                    .get(key)
                    .ok_or_else(|| ChainError::InvalidBlock(format!("dag node {key} has no tx")))?;
                let tid = tid_of(key);
                let receipt = {
                    let state = world.prepare(tid.clone())?;
                    execute_transaction(tx, &state, vm.as_ref(), &ctx)?
                };
                let deps = world.check_and_update(&tid)?;
                let ancestors = dag.ancestors(index);
                for dep in deps.iter().filter_map(hash_of) {
                    let allowed = dag
                        .index_of(&dep)
                        .map(|i| ancestors.binary_search(&i).is_ok())
                        .unwrap_or(false);
                    if !allowed {
                        return Err(ChainError::InvalidBlock(format!(
                            "tx {key} depends on {dep} which is not an ancestor"
                        )));
                    }
                }
                receipts.lock().insert(*key, receipt);
                Ok(())
            }
        };

        Dispatcher::new(dag.clone(), self.concurrency)
            .run(callback)
            .await
            .map_err(|e| match e {
                DispatchError::Callback(ChainError::Mvcc(m)) if m.is_conflict() => {
                    ChainError::InvalidBlock(format!("conflicting transactions: {m}"))
                }
                DispatchError::Callback(ChainError::Tx(t)) => {
                    ChainError::InvalidBlock(format!("unexecutable transaction: {t}"))
                }
                DispatchError::Callback(inner) => inner,
                other => ChainError::Execution(other.to_string()),
            })?;

        let receipts = std::mem::take(&mut *receipts.lock());
        Ok(ExecutionOutcome {
            transactions: block.transactions.clone(),
            dag: block.dag.clone(),
            receipts,
            ..Default::default()
        })
    }

    /// Coinbase credit on the block layer, then commit.
    fn finish(
        &self,
        world: &WorldState,
        coinbase: Address,
        outcome: &mut ExecutionOutcome,
    ) -> ChainResult<()> {
        let credit = outcome.total_fees().saturating_add(self.block_reward);
        world.add_balance(&coinbase, credit)?;
        outcome.events_root = outcome.events_root()?;
        outcome.state_root = world.commit()?;
        debug!(
            txs = outcome.transactions.len(),
            state_root = %outcome.state_root,
            "block body executed"
        );
        Ok(())
    }
}

/// Drop a transaction's staging layer. A failure leaves an orphan layer
/// behind but does not affect the block being produced.
fn discard(world: &WorldState, tid: &Tid) {
    if let Err(e) = world.reset(tid) {
        warn!(%tid, error = %e, "staging reset failed");
    }
}

fn dag_error(e: crate::util::DagError) -> ChainError {
    warn!(error = %e, "execution dag");
    ChainError::Execution(e.to_string())
}
