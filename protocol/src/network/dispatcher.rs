//! Inbound message routing.
//!
//! Streams hand every non-control message to [`NetDispatcher::put`], which
//! only enqueues. A single routing task drains the queue: gossip duplicates
//! are dropped, then the message is copied to every subscriber of its name.
//! Names nobody subscribed to go to the external handler if one is set.
//! A full queue or subscriber channel drops the message and counts it.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use libp2p::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{trace, warn};

use super::message::Message;
use super::protocol::is_gossip;
use crate::config::{DISPATCHER_DEDUP_CACHE_SIZE, DISPATCHER_QUEUE_CAPACITY};

/// A message as seen by a subscriber.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: PeerId,
    pub name: String,
    pub data: Bytes,
    pub checksum: u32,
}

impl InboundMessage {
    pub fn new(from: PeerId, msg: &Message) -> Self {
        Self {
            from,
            name: msg.name().to_string(),
            data: msg.data().clone(),
            checksum: msg.data_checksum(),
        }
    }
}

pub struct NetDispatcher {
    subscribers: DashMap<String, Vec<mpsc::Sender<InboundMessage>>>,
    external: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    queue_tx: mpsc::Sender<InboundMessage>,
    queue_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    seen: Mutex<LruCache<(String, u32), ()>>,
    received: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

impl Default for NetDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDispatcher {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(DISPATCHER_QUEUE_CAPACITY);
        let cap = NonZeroUsize::new(DISPATCHER_DEDUP_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            subscribers: DashMap::new(),
            external: Mutex::new(None),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            seen: Mutex::new(LruCache::new(cap)),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Receive every message named in `names`.
    pub fn subscribe(&self, names: &[&str], capacity: usize) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for name in names {
            self.subscribers
                .entry((*name).to_string())
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    /// Receive messages nobody else subscribed to.
    pub fn subscribe_external(&self, capacity: usize) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.external.lock() = Some(tx);
        rx
    }

    pub fn put(&self, from: PeerId, msg: Message) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if self.queue_tx.try_send(InboundMessage::new(from, &msg)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(name = msg.name(), "dispatcher queue full, message dropped");
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// True the first time a gossip payload is seen.
    fn first_sighting(&self, msg: &InboundMessage) -> bool {
        let key = (msg.name.clone(), msg.checksum);
        let mut seen = self.seen.lock();
        if seen.contains(&key) {
            return false;
        }
        seen.put(key, ());
        true
    }

    fn route(&self, msg: InboundMessage) {
        if is_gossip(&msg.name) && !self.first_sighting(&msg) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            trace!(name = %msg.name, from = %msg.from, "duplicate gossip");
            return;
        }
        let targets = self.subscribers.get(&msg.name).map(|s| s.clone());
        match targets {
            Some(targets) if !targets.is_empty() => {
                for tx in targets {
                    if tx.try_send(msg.clone()).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(name = %msg.name, "subscriber full, message dropped");
                    }
                }
            }
            _ => {
                let external = self.external.lock().clone();
                match external {
                    Some(tx) => {
                        if tx.try_send(msg).is_err() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => trace!(name = %msg.name, "no subscriber"),
                }
            }
        }
    }

    /// Routing loop. Only the first caller gets the queue.
    pub async fn run(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            warn!("dispatcher already running");
            return;
        };
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.route(msg),
                    None => break,
                },
            }
        }
    }
}
