//! Bloom filter of `(peer, payload checksum)` pairs.
//!
//! A peer that already has a gossip payload tells us so with `recvedmsg`;
//! the pair lands here and broadcast skips that peer for that checksum.
//! False positives only cost a missed send, and the peer still gets the
//! data from someone else. The filter clears itself after a fixed number
//! of inserts so its false-positive rate stays bounded.

use std::io::Cursor;

use bitvec::prelude::*;
use libp2p::PeerId;
use parking_lot::Mutex;

use crate::config::{RECV_FILTER_BITS, RECV_FILTER_HASHES, RECV_FILTER_RESET_COUNT};

fn murmur(element: &[u8], seed: u32) -> u64 {
    murmur3::murmur3_x64_128(&mut Cursor::new(element), seed).unwrap_or(0) as u64
}

struct Bits {
    bits: BitVec<u8, Lsb0>,
    inserted: usize,
}

pub struct RecvFilter {
    inner: Mutex<Bits>,
    size: usize,
    hashes: u32,
    reset_after: usize,
}

impl Default for RecvFilter {
    fn default() -> Self {
        Self::new(RECV_FILTER_BITS, RECV_FILTER_HASHES, RECV_FILTER_RESET_COUNT)
    }
}

impl RecvFilter {
    pub fn new(size: usize, hashes: u32, reset_after: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Mutex::new(Bits {
                bits: bitvec![u8, Lsb0; 0; size],
                inserted: 0,
            }),
            size,
            hashes: hashes.max(1),
            reset_after,
        }
    }

    fn key(peer: &PeerId, checksum: u32) -> Vec<u8> {
        let mut key = peer.to_bytes();
        key.extend_from_slice(&checksum.to_be_bytes());
        key
    }

    // Double hashing: position i is h1 + i * h2.
    fn positions(&self, key: &[u8]) -> impl Iterator<Item = usize> {
        let h1 = murmur(key, 0);
        let h2 = murmur(key, 1);
        let m = self.size as u64;
        (0..self.hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn insert(&self, peer: &PeerId, checksum: u32) {
        let key = Self::key(peer, checksum);
        let mut inner = self.inner.lock();
        if self.reset_after > 0 && inner.inserted >= self.reset_after {
            inner.bits.fill(false);
            inner.inserted = 0;
        }
        for pos in self.positions(&key) {
            inner.bits.set(pos, true);
        }
        inner.inserted += 1;
    }

    pub fn contains(&self, peer: &PeerId, checksum: u32) -> bool {
        let key = Self::key(peer, checksum);
        let inner = self.inner.lock();
        self.positions(&key).all(|pos| inner.bits[pos])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::identity;

    fn peer() -> PeerId {
        identity::generate().unwrap().public().to_peer_id()
    }

    #[test]
    fn inserted_pairs_are_found() {
        let filter = RecvFilter::default();
        let (a, b) = (peer(), peer());
        filter.insert(&a, 42);
        assert!(filter.contains(&a, 42));
        assert!(!filter.contains(&a, 43));
        assert!(!filter.contains(&b, 42));
    }

    #[test]
    fn filter_resets_after_limit() {
        let filter = RecvFilter::new(4096, 4, 2);
        let peer = peer();
        filter.insert(&peer, 1);
        filter.insert(&peer, 2);
        assert!(filter.contains(&peer, 1));
        filter.insert(&peer, 3);
        assert!(filter.contains(&peer, 3));
        assert!(!filter.contains(&peer, 1));
    }
}
