// MVCC and storage benchmarks for the PoD protocol.
//
// Covers merging independent staging layers, trie inserts, priority deque
// churn, and wire framing.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pod_protocol::mvcc::{StagingTable, Tid};
use pod_protocol::network::Message;
use pod_protocol::storage::{MemoryStorage, Storage, Trie};
use pod_protocol::util::MinMaxHeap;

fn bench_merge_independent(c: &mut Criterion) {
    let mut group = c.benchmark_group("mvcc/merge_independent");
    for n in [16u64, 128, 1024] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_with_setup(
                || {
                    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
                    let root = Tid::from("root");
                    let table = StagingTable::new(storage, root.clone());
                    for i in 0..n {
                        let tid = Tid::from(i);
                        table.prepare(&root, tid.clone()).unwrap();
                        table.put(&tid, &i.to_be_bytes(), b"value").unwrap();
                    }
                    table
                },
                |table| {
                    for i in 0..n {
                        table.merge_to_parent(&Tid::from(i)).unwrap();
                    }
                },
            );
        });
    }
    group.finish();
}

fn bench_trie_put(c: &mut Criterion) {
    c.bench_function("trie/put_1000", |b| {
        b.iter(|| {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            let mut trie = Trie::new(storage);
            for i in 0u32..1000 {
                trie.put(&i.to_be_bytes(), b"value").unwrap();
            }
            trie.root_hash()
        });
    });
}

fn bench_minmax_heap(c: &mut Criterion) {
    c.bench_function("minmax_heap/insert_pop_both", |b| {
        b.iter(|| {
            let mut heap = MinMaxHeap::with_capacity(1024);
            for i in 0u64..1024 {
                heap.insert(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            }
            while heap.pop_min().is_some() && heap.pop_max().is_some() {}
        });
    });
}

fn bench_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("message/decode");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let frame = Message::new(1, 0, "newblock", vec![0xAA; size]).unwrap().encode();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| Message::decode(frame, 1).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_merge_independent,
    bench_trie_put,
    bench_minmax_heap,
    bench_framing,
);
criterion_main!(benches);
