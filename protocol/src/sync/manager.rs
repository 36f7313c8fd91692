//! Sync service.
//!
//! Serves `ChainSync` and `ChainGetChunk` from the local chain at any time.
//! While a catch-up runs, `ChainChunks` and `ChainChunkData` replies are
//! forwarded to it; outside a catch-up they are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::chunk::{
    generate_chunk_data, generate_chunk_headers, verify_chunk_data, ChainSync, ChunkData,
    ChunkHeader, ChunkHeaders,
};
use super::{SyncError, SyncNetwork, SyncResult};
use crate::chain::BlockPool;
use crate::config::{
    CHUNK_DATA_TIMEOUT, CONCURRENT_SYNC_CHUNK_DATA_COUNT, MAX_CHUNK_RETRIES, SYNC_RESPONSE_WINDOW,
};
use crate::crypto::Hash;
use crate::network::protocol::{decode, encode};
use crate::network::{InboundMessage, CHAIN_CHUNKS, CHAIN_CHUNK_DATA, CHAIN_GET_CHUNK, CHAIN_SYNC};

const SYNC_INBOX_CAPACITY: usize = 256;

/// The header set at least √N of N responders agree on, with the peers
/// that sent it.
pub fn agree(responses: &HashMap<PeerId, ChunkHeaders>) -> Option<(ChunkHeaders, Vec<PeerId>)> {
    if responses.is_empty() {
        return None;
    }
    let threshold = ((responses.len() as f64).sqrt().ceil() as usize).max(1);
    let mut groups: HashMap<Hash, (&ChunkHeaders, Vec<PeerId>)> = HashMap::new();
    for (peer, headers) in responses {
        groups.entry(headers.root).or_insert_with(|| (headers, Vec::new())).1.push(*peer);
    }
    groups
        .into_values()
        .filter(|(_, peers)| peers.len() >= threshold)
        .max_by_key(|(headers, peers)| (peers.len(), headers.headers.len()))
        .map(|(headers, peers)| (headers.clone(), peers))
}

struct InFlight {
    index: usize,
    peer: PeerId,
    deadline: Instant,
    attempts: usize,
}

pub struct SyncService {
    pool: Arc<BlockPool>,
    net: Arc<dyn SyncNetwork>,
    inbox: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    running: AtomicBool,
}

impl SyncService {
    /// Message names the service subscribes to.
    pub const NAMES: [&'static str; 4] = [CHAIN_SYNC, CHAIN_CHUNKS, CHAIN_GET_CHUNK, CHAIN_CHUNK_DATA];

    pub fn new(pool: Arc<BlockPool>, net: Arc<dyn SyncNetwork>) -> Self {
        Self {
            pool,
            net,
            inbox: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Answer a request or pass a reply to the running catch-up.
    pub fn handle(&self, msg: InboundMessage) {
        let result = match msg.name.as_str() {
            CHAIN_SYNC => self.answer_sync(&msg),
            CHAIN_GET_CHUNK => self.answer_get_chunk(&msg),
            CHAIN_CHUNKS | CHAIN_CHUNK_DATA => {
                if let Some(tx) = self.inbox.lock().as_ref() {
                    if tx.try_send(msg).is_err() {
                        debug!("sync inbox full, reply dropped");
                    }
                }
                return;
            }
            _ => return,
        };
        if let Err(e) = result {
            debug!(error = %e, "sync request not answered");
        }
    }

    fn answer_sync(&self, msg: &InboundMessage) -> SyncResult<()> {
        let req: ChainSync = decode(&msg.data)?;
        let headers = generate_chunk_headers(self.pool.chain(), &req.tail_hash)?;
        trace!(from = %msg.from, point = %req.tail_hash, chunks = headers.headers.len(), "chunk headers served");
        self.net.request(&msg.from, CHAIN_CHUNKS, encode(&headers)?)
    }

    fn answer_get_chunk(&self, msg: &InboundMessage) -> SyncResult<()> {
        let header: ChunkHeader = decode(&msg.data)?;
        let data = generate_chunk_data(self.pool.chain(), &header)?;
        trace!(from = %msg.from, root = %header.root, "chunk data served");
        self.net.request(&msg.from, CHAIN_CHUNK_DATA, encode(&data)?)
    }

    /// Handle sync traffic until `quit` flips.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }
        debug!("sync service stopped");
    }

    /// Catch up until peers offer no further full chunk. Minting is
    /// suspended throughout. Returns the number of blocks linked.
    pub async fn sync(&self) -> SyncResult<u64> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyRunning);
        }
        let (tx, mut rx) = mpsc::channel(SYNC_INBOX_CAPACITY);
        *self.inbox.lock() = Some(tx);
        self.pool.engine().suspend_mint();
        info!(tail = self.pool.chain().tail().height(), "sync started");

        let mut total = 0u64;
        let result = loop {
            match self.round(&mut rx).await {
                Ok(0) => break Ok(total),
                Ok(n) => total += n,
                Err(e) => break Err(e),
            }
        };

        *self.inbox.lock() = None;
        self.pool.engine().resume_mint();
        self.running.store(false, Ordering::Release);
        match &result {
            Ok(n) => info!(blocks = n, tail = self.pool.chain().tail().height(), "sync finished"),
            Err(e) => warn!(error = %e, blocks = total, "sync aborted"),
        }
        result
    }

    /// One request-agree-fetch pass from the current tail.
    async fn round(&self, inbox: &mut mpsc::Receiver<InboundMessage>) -> SyncResult<u64> {
        while inbox.try_recv().is_ok() {}

        let tail = self.pool.chain().tail().hash();
        let request = encode(&ChainSync { tail_hash: tail })?;
        let asked: HashSet<PeerId> = self.net.request_sync_peers(CHAIN_SYNC, request).into_iter().collect();
        if asked.is_empty() {
            return Err(SyncError::NoPeers);
        }

        let responses = collect_headers(inbox, &asked).await;
        let (headers, peers) = agree(&responses).ok_or(SyncError::NoAgreement)?;
        debug!(
            responders = responses.len(),
            agreeing = peers.len(),
            chunks = headers.headers.len(),
            "chunk headers agreed"
        );
        if headers.is_empty() {
            return Ok(0);
        }
        self.fetch_chunks(inbox, &headers, &peers).await
    }

    /// Ask a random peer of `peers` for `header`'s blocks, avoiding
    /// `avoid` when there is a choice.
    fn ask_chunk(&self, header: &ChunkHeader, peers: &[PeerId], avoid: Option<PeerId>) -> SyncResult<PeerId> {
        let mut candidates: Vec<PeerId> = peers.iter().copied().filter(|p| Some(*p) != avoid).collect();
        if candidates.is_empty() {
            candidates = peers.to_vec();
        }
        candidates.shuffle(&mut rand::thread_rng());
        let request = encode(header)?;
        for peer in candidates {
            match self.net.request(&peer, CHAIN_GET_CHUNK, request.clone()) {
                Ok(()) => return Ok(peer),
                Err(e) => debug!(%peer, error = %e, "chunk request not sent"),
            }
        }
        Err(SyncError::NoPeers)
    }

    async fn fetch_chunks(
        &self,
        inbox: &mut mpsc::Receiver<InboundMessage>,
        headers: &ChunkHeaders,
        peers: &[PeerId],
    ) -> SyncResult<u64> {
        let total = headers.headers.len();
        let mut next_request = 0;
        let mut next_apply = 0;
        let mut in_flight: HashMap<Hash, InFlight> = HashMap::new();
        let mut ready: HashMap<usize, ChunkData> = HashMap::new();
        let mut linked = 0u64;

        while next_apply < total {
            while in_flight.len() < CONCURRENT_SYNC_CHUNK_DATA_COUNT && next_request < total {
                let header = &headers.headers[next_request];
                let peer = self.ask_chunk(header, peers, None)?;
                in_flight.insert(
                    header.root,
                    InFlight {
                        index: next_request,
                        peer,
                        deadline: Instant::now() + CHUNK_DATA_TIMEOUT,
                        attempts: 1,
                    },
                );
                next_request += 1;
            }

            let earliest = in_flight
                .values()
                .map(|f| f.deadline)
                .min()
                .unwrap_or_else(Instant::now);
            tokio::select! {
                _ = tokio::time::sleep_until(earliest) => {
                    let now = Instant::now();
                    for (root, flight) in in_flight.iter_mut().filter(|(_, f)| f.deadline <= now) {
                        if flight.attempts >= MAX_CHUNK_RETRIES {
                            return Err(SyncError::Timeout(*root));
                        }
                        warn!(%root, peer = %flight.peer, attempt = flight.attempts, "chunk timed out, resending");
                        flight.peer = self.ask_chunk(&headers.headers[flight.index], peers, Some(flight.peer))?;
                        flight.attempts += 1;
                        flight.deadline = now + CHUNK_DATA_TIMEOUT;
                    }
                }
                msg = inbox.recv() => {
                    let Some(msg) = msg else {
                        return Err(SyncError::NoPeers);
                    };
                    if msg.name != CHAIN_CHUNK_DATA {
                        continue;
                    }
                    let data: ChunkData = match decode(&msg.data) {
                        Ok(d) => d,
                        Err(e) => {
                            debug!(from = %msg.from, error = %e, "undecodable chunk");
                            continue;
                        }
                    };
                    let Some(index) = in_flight.get(&data.root).map(|f| f.index) else {
                        continue;
                    };
                    match verify_chunk_data(&headers.headers[index], &data) {
                        Ok(()) => {
                            in_flight.remove(&data.root);
                            ready.insert(index, data);
                        }
                        Err(e) => {
                            warn!(from = %msg.from, root = %data.root, error = %e, "bad chunk, resending");
                            if let Some(flight) = in_flight.get_mut(&data.root) {
                                flight.deadline = Instant::now();
                            }
                        }
                    }
                }
            }

            while let Some(data) = ready.remove(&next_apply) {
                for block in data.blocks {
                    if self.pool.push_block(block, false).await? {
                        linked += 1;
                    }
                }
                next_apply += 1;
            }
        }
        Ok(linked)
    }
}

/// Gather `ChainChunks` replies from `asked` until all answered or the
/// response window closes. Replies that fail verification are ignored.
async fn collect_headers(
    inbox: &mut mpsc::Receiver<InboundMessage>,
    asked: &HashSet<PeerId>,
) -> HashMap<PeerId, ChunkHeaders> {
    let deadline = Instant::now() + SYNC_RESPONSE_WINDOW;
    let mut responses = HashMap::new();
    while responses.len() < asked.len() {
        let msg = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            msg = inbox.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        if msg.name != CHAIN_CHUNKS || !asked.contains(&msg.from) || responses.contains_key(&msg.from) {
            continue;
        }
        match decode::<ChunkHeaders>(&msg.data).map_err(SyncError::from).and_then(|h| h.verify().map(|()| h)) {
            Ok(headers) => {
                responses.insert(msg.from, headers);
            }
            Err(e) => debug!(from = %msg.from, error = %e, "chunk headers rejected"),
        }
    }
    responses
}
