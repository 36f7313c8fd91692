//! # Route Table
//!
//! Kademlia-style table of known peers. The distance between two peers is
//! the XOR of the SHA-256 of their peer ids; a peer lands in the bucket
//! given by the length of the common prefix with the local node.
//!
//! ## Cache file
//!
//! ```text
//! # 1735689600
//! /ip4/10.0.0.7/tcp/8680/ipfs/12D3KooW...
//! /ip4/10.0.0.8/tcp/8680/ipfs/12D3KooW...
//! ```
//!
//! The first line is a `#` comment carrying the save time. Every other
//! non-empty line is a multiaddr with the peer id as its `/ipfs/` suffix.
//! The internal node list uses the same format; its peers are never
//! evicted and never handed out as random sync targets.
//!
//! The table tracks whether its membership changed since the last save, so
//! the periodic save only rewrites the file when there is something new.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::protocol::{PeerRecord, RouteTablePayload};
use super::stream::{now_ms, StreamError, StreamResult};

const BUCKETS: usize = 257;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub last_seen_ms: i64,
}

fn key_of(peer: &PeerId) -> [u8; 32] {
    Sha256::digest(peer.to_bytes()).into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn common_prefix_len(a: &[u8; 32], b: &[u8; 32]) -> usize {
    let d = xor(a, b);
    let mut bits = 0;
    for byte in d {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros() as usize;
            break;
        }
    }
    bits
}

pub fn join_peer_addr(addr: &Multiaddr, peer: PeerId) -> String {
    // The `/ipfs/` spelling is what the cache format expects.
    format!("{addr}/ipfs/{}", peer.to_base58())
}

/// Parse one cache/seed line.
pub fn parse_peer_line(line: &str) -> Option<(Multiaddr, PeerId)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (base, peer) = line.rsplit_once("/ipfs/").or_else(|| line.rsplit_once("/p2p/"))?;
    let peer: PeerId = peer.parse().ok()?;
    let addr: Multiaddr = base.parse().ok()?;
    Some((addr, peer))
}

struct Inner {
    buckets: Vec<VecDeque<PeerId>>,
    peers: HashMap<PeerId, PeerInfo>,
}

pub struct RouteTable {
    local: PeerId,
    local_key: [u8; 32],
    bucket_size: usize,
    internal: RwLock<HashSet<PeerId>>,
    inner: RwLock<Inner>,
    max_sync_reply: usize,
    dirty: AtomicBool,
}

impl RouteTable {
    pub fn new(local: PeerId, bucket_size: usize, max_sync_reply: usize) -> Self {
        Self {
            local,
            local_key: key_of(&local),
            bucket_size: bucket_size.max(1),
            internal: RwLock::new(HashSet::new()),
            inner: RwLock::new(Inner {
                buckets: vec![VecDeque::new(); BUCKETS],
                peers: HashMap::new(),
            }),
            max_sync_reply,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    fn bucket_of(&self, peer: &PeerId) -> usize {
        common_prefix_len(&self.local_key, &key_of(peer)).min(BUCKETS - 1)
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.inner.read().peers.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.inner.read().peers.get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn is_internal(&self, peer: &PeerId) -> bool {
        self.internal.read().contains(peer)
    }

    /// Membership changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Up to `count` random known peers accepted by `eligible`. Internal
    /// nodes are never returned.
    pub fn random_peers(&self, count: usize, eligible: impl Fn(&PeerId) -> bool) -> Vec<PeerId> {
        let internal = self.internal.read().clone();
        let mut candidates: Vec<PeerId> = self
            .inner
            .read()
            .peers
            .keys()
            .filter(|p| !internal.contains(*p) && eligible(*p))
            .copied()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }

    /// Insert or refresh `peer`. A full bucket evicts its least recently
    /// seen non-internal member; if every member is internal the new peer
    /// is dropped.
    pub fn add_peer(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> bool {
        if peer == self.local {
            return false;
        }
        let idx = self.bucket_of(&peer);
        let internal = self.internal.read().clone();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let now = now_ms();

        if let Some(info) = inner.peers.get_mut(&peer) {
            for a in addrs {
                if !info.addrs.contains(&a) {
                    info.addrs.push(a);
                    self.mark_dirty();
                }
            }
            info.last_seen_ms = now;
            let bucket = &mut inner.buckets[idx];
            bucket.retain(|p| p != &peer);
            bucket.push_back(peer);
            return true;
        }

        if inner.buckets[idx].len() >= self.bucket_size {
            let victim = inner.buckets[idx]
                .iter()
                .position(|p| !internal.contains(p));
            match victim {
                Some(pos) => {
                    if let Some(evicted) = inner.buckets[idx].remove(pos) {
                        inner.peers.remove(&evicted);
                        debug!(peer = %evicted, "evicted from route table");
                    }
                }
                None => return false,
            }
        }
        inner.buckets[idx].push_back(peer);
        inner.peers.insert(
            peer,
            PeerInfo {
                peer_id: peer,
                addrs,
                last_seen_ms: now,
            },
        );
        self.mark_dirty();
        true
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        if self.is_internal(peer) {
            return false;
        }
        let idx = self.bucket_of(peer);
        let mut inner = self.inner.write();
        inner.buckets[idx].retain(|p| p != peer);
        let removed = inner.peers.remove(peer).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn touch(&self, peer: &PeerId) {
        if let Some(info) = self.inner.write().peers.get_mut(peer) {
            info.last_seen_ms = now_ms();
        }
    }

    /// The `count` known peers closest to `target`.
    pub fn nearest(&self, target: &PeerId, count: usize) -> Vec<PeerInfo> {
        let target_key = key_of(target);
        let inner = self.inner.read();
        let mut all: Vec<(&PeerInfo, [u8; 32])> = inner
            .peers
            .values()
            .map(|p| (p, xor(&target_key, &key_of(&p.peer_id))))
            .collect();
        all.sort_by(|a, b| a.1.cmp(&b.1));
        all.into_iter().take(count).map(|(p, _)| p.clone()).collect()
    }

    /// Reply to a `syncroute` from `peer`.
    pub fn payload_for(&self, peer: &PeerId) -> RouteTablePayload {
        RouteTablePayload {
            peers: self
                .nearest(peer, self.max_sync_reply + 1)
                .into_iter()
                .filter(|p| &p.peer_id != peer)
                .take(self.max_sync_reply)
                .map(|p| PeerRecord {
                    peer_id: p.peer_id.to_base58(),
                    addrs: p.addrs.iter().map(|a| a.to_string()).collect(),
                })
                .collect(),
        }
    }

    /// Merge a `routetable` reply. Malformed records are skipped.
    pub fn add_records(&self, records: &[PeerRecord]) -> usize {
        let mut added = 0;
        for record in records {
            let Ok(peer) = record.peer_id.parse::<PeerId>() else {
                continue;
            };
            if self.contains(&peer) {
                continue;
            }
            let addrs: Vec<Multiaddr> = record.addrs.iter().filter_map(|a| a.parse().ok()).collect();
            if !addrs.is_empty() && self.add_peer(peer, addrs) {
                added += 1;
            }
        }
        added
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn read_lines(path: &Path) -> StreamResult<Vec<(Multiaddr, PeerId)>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(raw.lines().filter_map(parse_peer_line).collect())
    }

    pub fn load_cache(&self, path: &Path) -> StreamResult<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for (addr, peer) in Self::read_lines(path)? {
            if self.add_peer(peer, vec![addr]) {
                loaded += 1;
            }
        }
        info!(path = %path.display(), loaded, "route table cache loaded");
        Ok(loaded)
    }

    pub fn load_internal_nodes(&self, path: &Path) -> StreamResult<usize> {
        let entries = Self::read_lines(path)?;
        {
            let mut internal = self.internal.write();
            for (_, peer) in &entries {
                internal.insert(*peer);
            }
        }
        for (addr, peer) in &entries {
            self.add_peer(*peer, vec![addr.clone()]);
        }
        Ok(entries.len())
    }

    /// Save only when membership changed. Returns whether the file was
    /// written.
    pub fn save_cache_if_dirty(&self, path: &Path) -> StreamResult<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save_cache(path)?;
        Ok(true)
    }

    pub fn save_cache(&self, path: &Path) -> StreamResult<()> {
        // Cleared up front so a change racing the write marks it again.
        let was_dirty = self.dirty.swap(false, Ordering::AcqRel);
        let mut out = format!("# {}\n", chrono::Utc::now().timestamp());
        let mut peers = self.peers();
        peers.sort_by(|a, b| a.peer_id.to_bytes().cmp(&b.peer_id.to_bytes()));
        for peer in peers {
            for addr in &peer.addrs {
                out.push_str(&join_peer_addr(addr, peer.peer_id));
                out.push('\n');
            }
        }
        let written = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(path, out));
        written.map_err(|e| {
            if was_dirty {
                self.mark_dirty();
            }
            warn!(path = %path.display(), error = %e, "route table save failed");
            StreamError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::identity;

    fn peer() -> PeerId {
        identity::generate().unwrap().public().to_peer_id()
    }

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn local_peer_is_never_added() {
        let local = peer();
        let table = RouteTable::new(local, 16, 8);
        assert!(!table.add_peer(local, vec![addr(1)]));
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_evicts_oldest_non_internal() {
        let local = peer();
        let table = RouteTable::new(local, 1, 8);
        // Find two peers that share a bucket.
        let first = peer();
        let bucket = table.bucket_of(&first);
        let second = std::iter::repeat_with(peer)
            .find(|p| table.bucket_of(p) == bucket)
            .unwrap();
        assert!(table.add_peer(first, vec![addr(1)]));
        assert!(table.add_peer(second, vec![addr(2)]));
        assert!(!table.contains(&first));
        assert!(table.contains(&second));
    }

    #[test]
    fn internal_peers_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let local = peer();
        let table = RouteTable::new(local, 1, 8);
        let pinned = peer();
        let list = dir.path().join("internal.txt");
        std::fs::write(&list, format!("{}\n", join_peer_addr(&addr(9), pinned))).unwrap();
        assert_eq!(table.load_internal_nodes(&list).unwrap(), 1);

        let bucket = table.bucket_of(&pinned);
        let rival = std::iter::repeat_with(peer)
            .find(|p| table.bucket_of(p) == bucket)
            .unwrap();
        assert!(!table.add_peer(rival, vec![addr(3)]));
        assert!(table.contains(&pinned));
        assert!(!table.remove_peer(&pinned));
    }

    #[test]
    fn cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routetable.cache");
        let table = RouteTable::new(peer(), 16, 8);
        let peers: Vec<PeerId> = (0..5).map(|_| peer()).collect();
        for (i, p) in peers.iter().enumerate() {
            table.add_peer(*p, vec![addr(9000 + i as u16)]);
        }
        table.save_cache(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("# "));
        assert!(raw.lines().skip(1).all(|l| l.contains("/ipfs/")));

        let reloaded = RouteTable::new(peer(), 16, 8);
        assert_eq!(reloaded.load_cache(&path).unwrap(), 5);
        for p in &peers {
            assert!(reloaded.contains(p));
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert!(parse_peer_line("# 12345").is_none());
        assert!(parse_peer_line("garbage").is_none());
        assert!(parse_peer_line("/ip4/1.2.3.4/tcp/1/ipfs/notapeer").is_none());
        let p = peer();
        let (a, id) = parse_peer_line(&join_peer_addr(&addr(7), p)).unwrap();
        assert_eq!(id, p);
        assert_eq!(a, addr(7));
    }

    #[test]
    fn membership_changes_mark_table_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routetable.cache");
        let table = RouteTable::new(peer(), 16, 8);
        assert!(!table.is_dirty());
        assert!(!table.save_cache_if_dirty(&path).unwrap());
        assert!(!path.exists());

        let p = peer();
        table.add_peer(p, vec![addr(1)]);
        assert!(table.is_dirty());
        assert!(table.save_cache_if_dirty(&path).unwrap());
        assert!(!table.is_dirty());

        // Seen again with nothing new: still clean.
        table.touch(&p);
        table.add_peer(p, vec![addr(1)]);
        assert!(!table.save_cache_if_dirty(&path).unwrap());

        table.add_peer(p, vec![addr(2)]);
        assert!(table.is_dirty());
        table.save_cache(&path).unwrap();

        assert!(table.remove_peer(&p));
        assert!(table.is_dirty());
        assert!(!table.remove_peer(&p));
    }

    #[test]
    fn random_peers_skip_internal_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let table = RouteTable::new(peer(), 64, 8);
        let pinned = peer();
        let list = dir.path().join("internal.txt");
        std::fs::write(&list, format!("{}\n", join_peer_addr(&addr(9), pinned))).unwrap();
        table.load_internal_nodes(&list).unwrap();
        let public: Vec<PeerId> = (0..6).map(|_| peer()).collect();
        for (i, p) in public.iter().enumerate() {
            table.add_peer(*p, vec![addr(100 + i as u16)]);
        }

        let all = table.random_peers(usize::MAX, |_| true);
        assert_eq!(all.len(), public.len());
        assert!(!all.contains(&pinned));

        let three = table.random_peers(3, |_| true);
        assert_eq!(three.len(), 3);
        assert!(three.iter().all(|p| public.contains(p)));

        let excluded = public[0];
        assert!(!table.random_peers(usize::MAX, |p| *p != excluded).contains(&excluded));
    }

    #[test]
    fn sync_reply_excludes_requester() {
        let table = RouteTable::new(peer(), 16, 3);
        let asker = peer();
        table.add_peer(asker, vec![addr(1)]);
        for i in 0..6 {
            table.add_peer(peer(), vec![addr(10 + i)]);
        }
        let payload = table.payload_for(&asker);
        assert_eq!(payload.peers.len(), 3);
        assert!(payload.peers.iter().all(|r| r.peer_id != asker.to_base58()));

        let other = RouteTable::new(peer(), 16, 3);
        assert_eq!(other.add_records(&payload.peers), 3);
    }
}
