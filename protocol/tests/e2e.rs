//! End-to-end tests for the PoD protocol library.
//!
//! These go through the public API only: versioned state over a real sled
//! database, parallel dispatch, wire framing, chunk generation over a
//! minted chain, and two nodes exchanging blocks with a transfer inside.
//!
//! Each test builds its own storage. Nothing is shared between tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use primitive_types::U256;

use pod_protocol::chain::{AccountStore, Block, BlockPool, Blockchain, Executor};
use pod_protocol::config::{ConsensusConfig, GenesisAllocation, GenesisConfig};
use pod_protocol::consensus::PodEngine;
use pod_protocol::crypto::{Address, Keypair};
use pod_protocol::mvcc::{MvccDb, MvccError, Tid};
use pod_protocol::network::{Broadcaster, Message, MessageError, Priority, NEW_BLOCK};
use pod_protocol::storage::{get_opt, MemoryStorage, SledStorage, Storage};
use pod_protocol::sync::chunk::hashes_root;
use pod_protocol::sync::{generate_chunk_data, generate_chunk_headers, verify_chunk_data, SyncError};
use pod_protocol::transaction::{AccountNonces, TransactionBuilder, TxPool};
use pod_protocol::util::{Dag, Dispatcher, MinMaxHeap};

const CHAIN_ID: u32 = 100;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Remembers every gossip call so tests can inspect what went out.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, bool)>>,
}

impl Recorder {
    fn count(&self, name: &str, relayed: bool) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(n, r)| n == name && *r == relayed)
            .count()
    }
}

impl Broadcaster for Recorder {
    fn broadcast(&self, name: &str, _data: Vec<u8>, _priority: Priority) {
        self.sent.lock().push((name.to_string(), false));
    }

    fn relay(&self, name: &str, _data: Vec<u8>, _priority: Priority) {
        self.sent.lock().push((name.to_string(), true));
    }
}

struct Node {
    pool: Arc<BlockPool>,
    engine: Arc<PodEngine>,
    gossip: Arc<Recorder>,
}

fn genesis(miner: Address, rich: &[Address]) -> GenesisConfig {
    GenesisConfig {
        chain_id: CHAIN_ID,
        timestamp: 0,
        dynasty: vec![miner],
        distribution: rich
            .iter()
            .map(|a| GenesisAllocation {
                address: *a,
                value: "1000000000000000000".into(),
            })
            .collect(),
    }
}

/// A node whose one-member dynasty is `miner`, so every slot is ours and
/// each block is final as soon as it is linked.
fn node(storage: Arc<dyn Storage>, miner: &Keypair, rich: &[Address]) -> Node {
    let chain = Arc::new(Blockchain::open(storage, &genesis(miner.address(), rich)).unwrap());
    let config = ConsensusConfig {
        dynasty_size: 1,
        ..ConsensusConfig::default()
    };
    let engine = Arc::new(PodEngine::new(config, &chain).with_miner(miner.clone(), None));
    engine.enable_mint();
    let gossip = Arc::new(Recorder::default());
    let nonces: Arc<dyn AccountNonces> = chain.clone();
    let tx_pool = Arc::new(TxPool::new(CHAIN_ID, 64, nonces));
    let pool = Arc::new(
        BlockPool::new(chain, engine.clone(), Executor::new(4, U256::from(5u64)), tx_pool)
            .with_broadcaster(gossip.clone()),
    );
    Node { pool, engine, gossip }
}

fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new())
}

/// Mint the block for slot `slot` (seconds), three seconds ahead of it.
async fn mint(node: &Node, slot: i64) -> Block {
    let block = node.engine.mint_block(&node.pool, slot * 1000 - 3_000).await.unwrap();
    node.pool.push_local(block.clone()).await.unwrap();
    block
}

// ---------------------------------------------------------------------------
// Versioned state
// ---------------------------------------------------------------------------

#[test]
fn sibling_writers_conflict_on_commit() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
    let db = MvccDb::new(storage.clone());
    db.begin().unwrap();

    let tid1 = Tid::from("tid1");
    let tid2 = Tid::from("tid2");
    let t1 = db.prepare(tid1.clone()).unwrap();
    t1.put(b"a", b"1").unwrap();
    let t2 = db.prepare(tid2.clone()).unwrap();
    t2.put(b"a", b"2").unwrap();

    assert!(db.check_and_update(&tid1).unwrap().is_empty());
    let err = db.check_and_update(&tid2).unwrap_err();
    assert!(err.is_conflict());
    assert!(matches!(err, MvccError::KeyConflict(keys) if keys == vec![b"a".to_vec()]));

    db.reset(&tid2).unwrap();
    db.commit().unwrap();
    assert_eq!(get_opt(&*storage, b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn reads_record_dependencies_and_commit_persists() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(dir.path()).unwrap());
    let db = MvccDb::new(storage.clone());
    db.begin().unwrap();

    let (tid1, tid2, tid3) = (Tid::from("tid1"), Tid::from("tid2"), Tid::from("tid3"));

    let t1 = db.prepare(tid1.clone()).unwrap();
    t1.put(b"a", b"1").unwrap();
    db.check_and_update(&tid1).unwrap();

    let t2 = db.prepare(tid2.clone()).unwrap();
    assert_eq!(t2.get(b"a").unwrap(), Some(b"1".to_vec()));
    t2.put(b"b", b"2").unwrap();
    assert_eq!(db.check_and_update(&tid2).unwrap(), vec![tid1]);

    let t3 = db.prepare(tid3.clone()).unwrap();
    t3.put(b"b", b"3").unwrap();
    assert_eq!(db.check_and_update(&tid3).unwrap(), vec![tid2]);

    // Nothing reaches storage before the root commits.
    assert_eq!(get_opt(&*storage, b"b").unwrap(), None);
    db.commit().unwrap();
    assert_eq!(get_opt(&*storage, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(get_opt(&*storage, b"b").unwrap(), Some(b"3".to_vec()));
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

#[test]
fn priority_deque_serves_both_ends() {
    let mut heap = MinMaxHeap::new();
    for v in [31, 46, 51, 10, 30, 21, 71, 41, 11, 13, 16, 8] {
        heap.insert(v);
    }
    assert_eq!(heap.pop_max(), Some(71));
    assert_eq!(heap.pop_min(), Some(8));
    assert_eq!(heap.pop_min(), Some(10));
    assert_eq!(heap.pop_max(), Some(51));
    assert_eq!(heap.pop_min(), Some(11));
    assert!(heap.min() <= heap.max());
    assert_eq!(heap.len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_runs_every_node_after_its_parents() {
    let edges = [(1, 2), (1, 3), (2, 4), (3, 5), (5, 6), (6, 7)];
    let mut dag = Dag::new();
    for k in 1..=7u32 {
        dag.add_node(k).unwrap();
    }
    for (a, b) in edges {
        dag.add_edge(&a, &b).unwrap();
    }

    let spans: Arc<Mutex<HashMap<u32, (Instant, Instant)>>> = Arc::default();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (spans2, active2, peak2) = (spans.clone(), active.clone(), peak.clone());

    Dispatcher::new(Arc::new(dag), 4)
        .run(move |_, key: &u32| -> Result<(), String> {
            let now = active2.fetch_add(1, Ordering::SeqCst) + 1;
            peak2.fetch_max(now, Ordering::SeqCst);
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(3));
            let prev = spans2.lock().insert(*key, (start, Instant::now()));
            assert!(prev.is_none(), "node {key} ran twice");
            active2.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let spans = spans.lock();
    assert_eq!(spans.len(), 7);
    for (a, b) in edges {
        assert!(spans[&a].1 <= spans[&b].0, "{a} must finish before {b} starts");
    }
    assert!(peak.load(Ordering::SeqCst) <= 4);
}

#[test]
fn framing_checksums_and_truncation() {
    let msg = Message::new(1, 0, "newblock", vec![0xAA; 1024]).unwrap();
    let frame = msg.encode();
    assert_eq!(frame.len(), 1060);

    let parsed = Message::decode(&frame, 1).unwrap();
    assert_eq!(parsed.name(), "newblock");
    assert_eq!(parsed.data().as_ref(), &[0xAA; 1024][..]);
    assert_eq!(parsed.data_checksum(), msg.data_checksum());

    assert_eq!(
        Message::decode(&frame[..frame.len() - 1], 1).unwrap_err(),
        MessageError::InsufficientData { need: 1060, got: 1059 }
    );

    let mut flipped = frame.to_vec();
    flipped[500] ^= 0xFF;
    assert_eq!(Message::decode(&flipped, 1).unwrap_err(), MessageError::InvalidDataChecksum);
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ninety_six_blocks_make_three_chunks() {
    let miner = Keypair::from_seed(&[3; 32]);
    let a = node(memory(), &miner, &[]);
    let sync_point = a.pool.chain().genesis().hash();
    for i in 1..=96 {
        mint(&a, 15 * i).await;
    }
    let chain = a.pool.chain();
    assert_eq!(chain.tail().height(), 97);

    let headers = generate_chunk_headers(chain, &sync_point).unwrap();
    assert_eq!(headers.headers.len(), 3);
    headers.verify().unwrap();

    let mut next_height = 2;
    for header in &headers.headers {
        assert_eq!(header.hashes.len(), 32);
        let data = generate_chunk_data(chain, header).unwrap();
        for block in &data.blocks {
            assert_eq!(block.height(), next_height);
            next_height += 1;
        }
        let hashes: Vec<_> = data.blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(hashes_root(&hashes).unwrap(), header.root);
        verify_chunk_data(header, &data).unwrap();
    }

    let header = &headers.headers[1];
    let mut corrupted = generate_chunk_data(chain, header).unwrap();
    corrupted.blocks[17].header.timestamp += 1;
    assert!(matches!(
        verify_chunk_data(header, &corrupted),
        Err(SyncError::InvalidBlockHashInChunk { index: 17, .. })
    ));
}

#[tokio::test]
async fn transfer_minted_on_one_node_replays_on_another() {
    let miner = Keypair::from_seed(&[4; 32]);
    let sender = Keypair::from_seed(&[5; 32]);
    let recipient = Keypair::from_seed(&[6; 32]).address();

    let dir = tempfile::tempdir().unwrap();
    let a = node(Arc::new(SledStorage::open(dir.path()).unwrap()), &miner, &[sender.address()]);
    let b = node(memory(), &miner, &[sender.address()]);

    let tx = TransactionBuilder::new(CHAIN_ID, sender.address(), recipient)
        .value(U256::from(1_000u64))
        .nonce(1)
        .build_signed(&sender)
        .unwrap();
    a.pool.tx_pool().push(tx).unwrap();

    let b2 = mint(&a, 15).await;
    let b3 = mint(&a, 30).await;
    assert_eq!(b2.transactions.len(), 1);
    assert!(a.pool.tx_pool().is_empty());
    assert_eq!(a.gossip.count(NEW_BLOCK, false), 2);

    // Out of order: b3 waits for its parent.
    assert!(!b.pool.push_block(b3.clone(), true).await.unwrap());
    assert_eq!(b.pool.orphan_count(), 1);
    assert!(b.pool.push_block(b2.clone(), true).await.unwrap());
    assert_eq!(b.pool.orphan_count(), 0);
    assert_eq!(b.gossip.count(NEW_BLOCK, true), 1);
    assert!(!b.pool.push_block(b3.clone(), true).await.unwrap());

    let (chain_a, chain_b) = (a.pool.chain(), b.pool.chain());
    assert_eq!(chain_b.tail().hash(), b3.hash());
    assert_eq!(chain_b.lib().hash(), chain_a.lib().hash());
    assert_eq!(chain_b.tail().header.state_root, chain_a.tail().header.state_root);

    let state = chain_b.state_at(&chain_b.tail()).unwrap();
    assert_eq!(state.account(&recipient).unwrap().balance, U256::from(1_000u64));
    assert_eq!(state.account(&sender.address()).unwrap().nonce, 1);
    assert_eq!(chain_b.committed_nonce(&sender.address()), 1);
}
