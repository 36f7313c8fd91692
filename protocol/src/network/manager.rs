//! Stream registry.
//!
//! Tracks established streams by peer, fans gossip out to them, and runs a
//! periodic cleanup that drops idle streams and trims the set back to the
//! configured maximum.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use libp2p::PeerId;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tracing::{debug, info};

use super::protocol::Priority;
use super::recv_filter::RecvFilter;
use super::stream::{now_ms, StreamError, StreamHandle, StreamResult};
use crate::config::{STREAM_CLEANUP_INTERVAL, STREAM_IDLE_TIMEOUT};

/// Which established peers a targeted send goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFilter {
    /// Every established peer.
    All,
    /// Up to `n` peers picked at random.
    Random(usize),
    /// Up to `n` random peers, outbound streams first. Chain sync asks these.
    ChainSync(usize),
}

impl PeerFilter {
    fn select(self, mut peers: Vec<(PeerId, bool)>) -> Vec<PeerId> {
        let mut rng = rand::thread_rng();
        match self {
            PeerFilter::All => {}
            PeerFilter::Random(n) => {
                peers.shuffle(&mut rng);
                peers.truncate(n);
            }
            PeerFilter::ChainSync(n) => {
                peers.shuffle(&mut rng);
                // Stable, so the shuffle survives within each group.
                peers.sort_by_key(|(_, outbound)| !*outbound);
                peers.truncate(n);
            }
        }
        peers.into_iter().map(|(p, _)| p).collect()
    }
}

pub struct StreamManager {
    streams: DashMap<PeerId, StreamHandle>,
    max_streams: usize,
    recv_filter: RecvFilter,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl StreamManager {
    pub fn new(max_streams: usize) -> Self {
        Self {
            streams: DashMap::new(),
            max_streams: max_streams.max(1),
            recv_filter: RecvFilter::default(),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    pub fn recv_filter(&self) -> &RecvFilter {
        &self.recv_filter
    }

    /// Register a freshly handshaken stream. Refuses a second stream to the
    /// same peer.
    pub fn add(&self, handle: StreamHandle) -> bool {
        match self.streams.entry(handle.peer_id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(handle);
                self.opened.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Unregister `handle`, leaving a newer stream to the same peer alone.
    pub fn remove(&self, peer: &PeerId, handle: &StreamHandle) {
        let removed = self.streams.remove_if(peer, |_, current| {
            current.created_ms() == handle.created_ms() && current.addr() == handle.addr()
        });
        if removed.is_some() {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<StreamHandle> {
        self.streams.get(peer).map(|s| s.clone())
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.streams.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.streams
            .iter()
            .filter(|s| s.is_established())
            .map(|s| *s.key())
            .collect()
    }

    /// Lifetime `(opened, closed)` counts.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.opened.load(Ordering::Relaxed),
            self.closed.load(Ordering::Relaxed),
        )
    }

    pub fn send_to(&self, peer: &PeerId, name: &str, data: Bytes, priority: Priority) -> StreamResult<()> {
        let stream = self.get(peer).ok_or(StreamError::NotConnected(*peer))?;
        stream.send(name, data, priority)
    }

    /// Send to every established stream that has not acked this payload.
    /// Returns the number of streams written to.
    pub fn broadcast(&self, name: &str, data: Bytes, priority: Priority) -> usize {
        self.fan_out(name, data, priority)
    }

    /// Forward a payload received from another peer. Same peer selection as
    /// [`broadcast`](Self::broadcast).
    pub fn relay(&self, name: &str, data: Bytes, priority: Priority) -> usize {
        self.fan_out(name, data, priority)
    }

    /// Send to the established peers chosen by `filter`. Returns the peers
    /// the message was actually queued for.
    pub fn send_message_to_peers(
        &self,
        name: &str,
        data: Bytes,
        priority: Priority,
        filter: PeerFilter,
    ) -> Vec<PeerId> {
        let candidates: Vec<(PeerId, bool)> = self
            .streams
            .iter()
            .filter(|s| s.is_established())
            .map(|s| (*s.key(), s.is_outbound()))
            .collect();
        let mut sent = Vec::new();
        for peer in filter.select(candidates) {
            match self.send_to(&peer, name, data.clone(), priority) {
                Ok(()) => sent.push(peer),
                Err(e) => debug!(%peer, name, error = %e, "send dropped"),
            }
        }
        sent
    }

    fn fan_out(&self, name: &str, data: Bytes, priority: Priority) -> usize {
        let checksum = crc32fast::hash(&data);
        let mut sent = 0;
        for stream in self.streams.iter() {
            if !stream.is_established() {
                continue;
            }
            if self.recv_filter.contains(stream.key(), checksum) {
                continue;
            }
            match stream.send(name, data.clone(), priority) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %stream.key(), name, error = %e, "send dropped"),
            }
        }
        sent
    }

    /// Close idle streams, then close the longest-idle ones until the set
    /// fits `max_streams`.
    pub fn cleanup(&self) -> usize {
        let now = now_ms();
        let idle_ms = STREAM_IDLE_TIMEOUT.as_millis() as i64;
        let mut live: Vec<StreamHandle> = Vec::with_capacity(self.streams.len());
        let mut closed = 0;
        for stream in self.streams.iter() {
            if now - stream.last_active_ms() > idle_ms {
                stream.close("idle");
                closed += 1;
            } else {
                live.push(stream.clone());
            }
        }
        if live.len() > self.max_streams {
            live.sort_by_key(|s| s.last_active_ms());
            let surplus = live.len() - self.max_streams;
            for stream in live.into_iter().take(surplus) {
                stream.close("too many streams");
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, remaining = self.len(), "stream cleanup");
        }
        closed
    }

    pub async fn run_cleanup(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(STREAM_CLEANUP_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = tick.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    pub fn close_all(&self, reason: &str) {
        for stream in self.streams.iter() {
            stream.close(reason);
        }
    }
}
