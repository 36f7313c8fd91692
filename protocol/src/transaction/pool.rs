//! Priority-ordered transaction pool.
//!
//! Pending transactions wait here until a proposer pulls them into a block.
//!
//! ## Design
//!
//! - Each sender has a bucket ordered by nonce. Only the lowest-nonce
//!   transaction of a bucket is a *candidate*; the rest wait their turn so
//!   a proposer never sees nonce `n+1` before `n`.
//! - Candidates sit in a [`MinMaxHeap`] keyed by gas price: `pop` takes the
//!   max. A second heap over every transaction gives the eviction victim
//!   (the min) when the pool is full.
//! - Heap entries are deleted lazily. A popped entry whose transaction is
//!   gone, or is no longer its bucket's head, is skipped. Heaps are
//!   compacted once stale entries outnumber live ones.
//!
//! All state lives behind one `parking_lot::Mutex`; every operation is a
//! few map lookups and heap moves.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::U256;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::types::{Transaction, TxError, TxResult};
use crate::crypto::{Address, Hash};
use crate::network::{Broadcaster, InboundMessage, Priority, NEW_TX};
use crate::util::MinMaxHeap;

/// Where the pool learns the committed nonce of an account.
pub trait AccountNonces: Send + Sync {
    fn committed_nonce(&self, address: &Address) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    gas_price: U256,
    seq: Reverse<u64>,
    hash: Hash,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gas_price
            .cmp(&other.gas_price)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<Hash, Arc<Transaction>>,
    buckets: HashMap<Address, BTreeMap<u64, Hash>>,
    candidates: MinMaxHeap<Entry>,
    all: MinMaxHeap<Entry>,
    seq: u64,
}

impl PoolInner {
    fn entry_for(&mut self, tx: &Transaction) -> Entry {
        self.seq += 1;
        Entry {
            gas_price: tx.gas_price,
            seq: Reverse(self.seq),
            hash: tx.hash,
        }
    }

    fn head_of(&self, from: &Address) -> Option<Hash> {
        self.buckets
            .get(from)
            .and_then(|b| b.values().next().copied())
    }

    fn is_candidate(&self, hash: &Hash) -> bool {
        self.txs
            .get(hash)
            .is_some_and(|tx| self.head_of(&tx.from) == Some(*hash))
    }

    fn insert(&mut self, tx: Arc<Transaction>) {
        let old_head = self.head_of(&tx.from);
        self.buckets
            .entry(tx.from)
            .or_default()
            .insert(tx.nonce, tx.hash);
        let entry = self.entry_for(&tx);
        self.all.insert(entry.clone());
        let new_head = self.head_of(&tx.from);
        self.txs.insert(tx.hash, tx);
        if new_head != old_head {
            self.candidates.insert(entry);
        }
    }

    /// Remove `hash`; if it was a bucket head, promote the next one.
    fn remove(&mut self, hash: &Hash) -> Option<Arc<Transaction>> {
        let tx = self.txs.remove(hash)?;
        let was_head = self.head_of(&tx.from) == Some(*hash);
        if let Some(bucket) = self.buckets.get_mut(&tx.from) {
            if bucket.get(&tx.nonce) == Some(hash) {
                bucket.remove(&tx.nonce);
            }
            if bucket.is_empty() {
                self.buckets.remove(&tx.from);
            }
        }
        if was_head {
            if let Some(next) = self.head_of(&tx.from).and_then(|h| self.txs.get(&h).cloned()) {
                let entry = self.entry_for(&next);
                self.candidates.insert(entry);
            }
        }
        self.compact();
        Some(tx)
    }

    fn compact(&mut self) {
        let live = self.txs.len();
        if self.all.len() > 2 * live + 64 {
            let txs = &self.txs;
            self.all.retain(|e| txs.contains_key(&e.hash));
        }
        if self.candidates.len() > 2 * self.buckets.len() + 64 {
            let mut seen = HashSet::new();
            let heads: HashSet<Hash> = self.buckets.values().filter_map(|b| b.values().next().copied()).collect();
            self.candidates
                .retain(|e| heads.contains(&e.hash) && seen.insert(e.hash));
        }
    }

    fn lowest_live(&mut self) -> Option<Entry> {
        while let Some(e) = self.all.min().cloned() {
            if self.txs.contains_key(&e.hash) {
                return Some(e);
            }
            self.all.pop_min();
        }
        None
    }
}

pub struct TxPool {
    chain_id: u32,
    capacity: usize,
    nonces: Arc<dyn AccountNonces>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for TxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPool")
            .field("chain_id", &self.chain_id)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl TxPool {
    pub fn new(chain_id: u32, capacity: usize, nonces: Arc<dyn AccountNonces>) -> Self {
        Self {
            chain_id,
            capacity: capacity.max(1),
            nonces,
            broadcaster: None,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Transaction>> {
        self.inner.lock().txs.get(hash).cloned()
    }

    /// Verify and admit a transaction. When the pool is full the cheapest
    /// transaction is evicted, unless the newcomer is cheaper still.
    pub fn push(&self, tx: Transaction) -> TxResult<()> {
        tx.verify_integrity(self.chain_id)?;
        let committed = self.nonces.committed_nonce(&tx.from);
        if tx.nonce <= committed {
            return Err(TxError::NonceTooLow {
                committed,
                got: tx.nonce,
            });
        }

        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&tx.hash) {
            return Err(TxError::Duplicate);
        }
        if inner.txs.len() >= self.capacity {
            match inner.lowest_live() {
                Some(lowest) if lowest.gas_price < tx.gas_price => {
                    inner.all.pop_min();
                    inner.remove(&lowest.hash);
                    debug!(evicted = %lowest.hash, "tx pool full, evicted cheapest");
                }
                _ => return Err(TxError::PoolFull),
            }
        }
        // A second transaction with the same nonce replaces the first only
        // if it pays more.
        let same_nonce = inner
            .buckets
            .get(&tx.from)
            .and_then(|b| b.get(&tx.nonce).copied());
        if let Some(existing) = same_nonce {
            let cheaper = inner
                .txs
                .get(&existing)
                .is_some_and(|old| old.gas_price >= tx.gas_price);
            if cheaper {
                return Err(TxError::Duplicate);
            }
            inner.remove(&existing);
        }
        trace!(tx = %tx.hash, from = %tx.from, nonce = tx.nonce, "tx admitted");
        inner.insert(Arc::new(tx));
        Ok(())
    }

    /// [`push`](Self::push), then relay the transaction to peers.
    pub fn push_and_relay(&self, tx: Transaction) -> TxResult<()> {
        let bytes = tx.encode()?;
        self.push(tx)?;
        if let Some(b) = &self.broadcaster {
            b.relay(NEW_TX, bytes, Priority::Normal);
        }
        Ok(())
    }

    /// [`push`](Self::push), then broadcast to every peer. Used for
    /// locally created transactions.
    pub fn push_and_broadcast(&self, tx: Transaction) -> TxResult<()> {
        let bytes = tx.encode()?;
        self.push(tx)?;
        if let Some(b) = &self.broadcaster {
            b.broadcast(NEW_TX, bytes, Priority::Normal);
        }
        Ok(())
    }

    /// Take the best-paying candidate.
    pub fn pop(&self) -> Option<Arc<Transaction>> {
        self.pop_excluding(&HashSet::new())
    }

    /// Take the best-paying candidate whose sender is not in `busy`.
    pub fn pop_excluding(&self, busy: &HashSet<Address>) -> Option<Arc<Transaction>> {
        let mut inner = self.inner.lock();
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(entry) = inner.candidates.pop_max() {
            if !inner.is_candidate(&entry.hash) {
                continue;
            }
            let busy_sender = inner
                .txs
                .get(&entry.hash)
                .is_some_and(|tx| busy.contains(&tx.from));
            if busy_sender {
                skipped.push(entry);
                continue;
            }
            found = inner.remove(&entry.hash);
            break;
        }
        for e in skipped {
            inner.candidates.insert(e);
        }
        found
    }

    /// Put back a transaction that was popped but not included.
    pub fn push_back(&self, tx: Arc<Transaction>) {
        let mut inner = self.inner.lock();
        if !inner.txs.contains_key(&tx.hash) {
            inner.insert(tx);
        }
    }

    /// Drop every transaction included in a block, along with anything of
    /// the same sender at or below the included nonce.
    pub fn prune(&self, included: &[Transaction]) {
        let mut inner = self.inner.lock();
        for tx in included {
            inner.remove(&tx.hash);
            let stale: Vec<Hash> = inner
                .buckets
                .get(&tx.from)
                .map(|b| b.range(..=tx.nonce).map(|(_, h)| *h).collect())
                .unwrap_or_default();
            for h in stale {
                inner.remove(&h);
            }
        }
    }

    /// Admit `newtx` gossip until `quit` flips. Rejected transactions are
    /// not relayed.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let result = Transaction::decode(&msg.data).and_then(|tx| self.push_and_relay(tx));
                    if let Err(e) = result {
                        trace!(from = %msg.from, error = %e, "tx dropped");
                    }
                }
            }
        }
        debug!("tx pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::transaction::TransactionBuilder;
    use crate::config::MIN_GAS_PRICE;

    struct Zero;

    impl AccountNonces for Zero {
        fn committed_nonce(&self, _: &Address) -> u64 {
            0
        }
    }

    fn pool(capacity: usize) -> TxPool {
        TxPool::new(1, capacity, Arc::new(Zero))
    }

    fn tx(kp: &Keypair, nonce: u64, price: u64) -> Transaction {
        TransactionBuilder::new(1, kp.address(), Address::null())
            .nonce(nonce)
            .gas_price(U256::from(MIN_GAS_PRICE + price))
            .build_signed(kp)
            .unwrap()
    }

    #[test]
    fn pops_highest_gas_price_first() {
        let p = pool(16);
        let (a, b, c) = (Keypair::generate(), Keypair::generate(), Keypair::generate());
        p.push(tx(&a, 1, 10)).unwrap();
        p.push(tx(&b, 1, 30)).unwrap();
        p.push(tx(&c, 1, 20)).unwrap();
        let order: Vec<Address> = std::iter::from_fn(|| p.pop()).map(|t| t.from).collect();
        assert_eq!(order, vec![b.address(), c.address(), a.address()]);
        assert!(p.is_empty());
    }

    #[test]
    fn nonces_of_one_sender_come_out_in_order() {
        let p = pool(16);
        let a = Keypair::generate();
        p.push(tx(&a, 2, 100)).unwrap();
        p.push(tx(&a, 1, 1)).unwrap();
        p.push(tx(&a, 3, 50)).unwrap();
        let nonces: Vec<u64> = std::iter::from_fn(|| p.pop()).map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![1, 2, 3]);
    }

    #[test]
    fn committed_nonce_and_duplicates_are_rejected() {
        struct Five;
        impl AccountNonces for Five {
            fn committed_nonce(&self, _: &Address) -> u64 {
                5
            }
        }
        let p = TxPool::new(1, 16, Arc::new(Five));
        let a = Keypair::generate();
        assert!(matches!(p.push(tx(&a, 5, 1)), Err(TxError::NonceTooLow { .. })));
        let t = tx(&a, 6, 1);
        p.push(t.clone()).unwrap();
        assert!(matches!(p.push(t), Err(TxError::Duplicate)));
    }

    #[test]
    fn full_pool_evicts_the_cheapest() {
        let p = pool(2);
        let (a, b, c, d) = (
            Keypair::generate(),
            Keypair::generate(),
            Keypair::generate(),
            Keypair::generate(),
        );
        p.push(tx(&a, 1, 5)).unwrap();
        p.push(tx(&b, 1, 10)).unwrap();
        assert!(matches!(p.push(tx(&c, 1, 1)), Err(TxError::PoolFull)));
        p.push(tx(&d, 1, 20)).unwrap();
        assert_eq!(p.len(), 2);
        let froms: Vec<Address> = std::iter::from_fn(|| p.pop()).map(|t| t.from).collect();
        assert_eq!(froms, vec![d.address(), b.address()]);
    }

    #[test]
    fn busy_senders_are_skipped_not_lost() {
        let p = pool(16);
        let (a, b) = (Keypair::generate(), Keypair::generate());
        p.push(tx(&a, 1, 100)).unwrap();
        p.push(tx(&b, 1, 1)).unwrap();
        let busy: HashSet<Address> = [a.address()].into_iter().collect();
        assert_eq!(p.pop_excluding(&busy).unwrap().from, b.address());
        assert_eq!(p.pop().unwrap().from, a.address());
    }

    #[test]
    fn prune_drops_included_and_older_nonces() {
        let p = pool(16);
        let a = Keypair::generate();
        let t1 = tx(&a, 1, 1);
        p.push(t1).unwrap();
        p.push(tx(&a, 2, 1)).unwrap();
        let t3 = tx(&a, 3, 1);
        p.push(t3.clone()).unwrap();
        p.push(tx(&a, 4, 1)).unwrap();
        p.prune(&[t3]);
        assert_eq!(p.len(), 1);
        assert_eq!(p.pop().unwrap().nonce, 4);
    }

    #[test]
    fn push_back_restores_a_popped_transaction() {
        let p = pool(16);
        let a = Keypair::generate();
        p.push(tx(&a, 1, 1)).unwrap();
        let popped = p.pop().unwrap();
        assert!(p.is_empty());
        p.push_back(popped.clone());
        assert_eq!(p.pop().unwrap().hash, popped.hash);
    }
}
