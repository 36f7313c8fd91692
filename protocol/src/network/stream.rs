//! # Peer Stream
//!
//! One TCP connection to one peer.
//!
//! ## Lifecycle
//!
//! ```text
//! connect/accept ─► handshake (HELLO → OK, 30 s) ─► register with manager
//!                                                   │
//!            ┌──────────────────────────────────────┴───────────┐
//!        read loop                                         write loop
//!   frame → control msgs handled here               High ▸ Normal ▸ Low
//!         → everything else to the dispatcher       (biased, FIFO per queue)
//!            └──────────────── quit / error ─────────────────────┘
//!                                   ▼
//!                        unregister, socket dropped
//! ```
//!
//! A protocol violation closes the stream. That covers a bad frame, an
//! unexpected handshake message, a chain id or client version mismatch, and
//! an oversized route table reply. Once a handshaken stream closes, its peer
//! leaves the route table too.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::message::{Message, MessageError, MessageHeader};
use super::protocol::{self, Bye, Hello, Priority, RecvedMsg, RouteTablePayload};
use super::service::NetContext;
use crate::config::{DEFAULT_MESSAGE_VERSION, HANDSHAKE_TIMEOUT, MESSAGE_HEADER_LENGTH, STREAM_QUEUE_CAPACITY};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("stream closed")]
    Closed,

    #[error("send queue full")]
    QueueFull,

    #[error("peer {0} not connected")]
    NotConnected(PeerId),

    #[error("invalid address: {0}")]
    Address(String),

    #[error("node identity: {0}")]
    Identity(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct Shared {
    peer_id: PeerId,
    addr: SocketAddr,
    outbound: bool,
    chain_id: u32,
    queues: [mpsc::Sender<Bytes>; 3],
    established: AtomicBool,
    created_ms: i64,
    last_active_ms: AtomicI64,
    quit: watch::Sender<bool>,
}

/// Cheap handle to a running stream. Sending only enqueues; the write loop
/// does the IO.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("peer", &self.shared.peer_id)
            .field("addr", &self.shared.addr)
            .field("outbound", &self.shared.outbound)
            .finish()
    }
}

impl StreamHandle {
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.shared.outbound
    }

    pub fn is_established(&self) -> bool {
        self.shared.established.load(Ordering::Acquire)
    }

    pub fn created_ms(&self) -> i64 {
        self.shared.created_ms
    }

    pub fn last_active_ms(&self) -> i64 {
        self.shared.last_active_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.shared.last_active_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Frame and enqueue a message.
    pub fn send(&self, name: &str, data: impl Into<Bytes>, priority: Priority) -> StreamResult<()> {
        let msg = Message::new(self.shared.chain_id, DEFAULT_MESSAGE_VERSION, name, data)?;
        let queue = &self.shared.queues[priority as usize];
        queue.try_send(msg.encode()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StreamError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => StreamError::Closed,
        })
    }

    /// Say goodbye and stop both loops.
    pub fn close(&self, reason: &str) {
        if let Ok(bye) = protocol::encode(&Bye {
            reason: reason.to_string(),
        }) {
            let _ = self.send(protocol::BYE, bye, Priority::High);
        }
        let _ = self.shared.quit.send(true);
    }

    fn is_closed(&self) -> bool {
        *self.shared.quit.borrow()
    }
}

// ---------------------------------------------------------------------------
// Frame IO
// ---------------------------------------------------------------------------

async fn read_message(reader: &mut OwnedReadHalf, chain_id: u32) -> StreamResult<Message> {
    let mut head = [0u8; MESSAGE_HEADER_LENGTH];
    reader.read_exact(&mut head).await?;
    let header = MessageHeader::parse(&head, chain_id)?;
    let mut data = vec![0u8; header.data_length as usize];
    reader.read_exact(&mut data).await?;
    Ok(Message::with_data(header, Bytes::from(data))?)
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> StreamResult<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

fn hello_for(ctx: &NetContext) -> StreamResult<Vec<u8>> {
    Ok(protocol::encode(&Hello {
        node_id: ctx.local_peer.to_base58(),
        client_version: ctx.client_version.clone(),
        listen_addrs: ctx.listen_addrs().iter().map(|a| a.to_string()).collect(),
    })?)
}

/// Client versions must match exactly.
fn compatible(ours: &str, theirs: &str) -> bool {
    ours == theirs
}

fn check_hello(ctx: &NetContext, hello: &Hello, expected: Option<PeerId>) -> StreamResult<PeerId> {
    let peer: PeerId = hello
        .node_id
        .parse()
        .map_err(|_| StreamError::Protocol(format!("bad node id {}", hello.node_id)))?;
    if peer == ctx.local_peer {
        return Err(StreamError::Protocol("connected to self".into()));
    }
    if let Some(exp) = expected {
        if exp != peer {
            return Err(StreamError::Protocol(format!("expected {exp}, got {peer}")));
        }
    }
    if !compatible(&ctx.client_version, &hello.client_version) {
        return Err(StreamError::Protocol(format!(
            "incompatible client version {}",
            hello.client_version
        )));
    }
    Ok(peer)
}

async fn handshake(
    ctx: &NetContext,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    outbound: bool,
    expected: Option<PeerId>,
) -> StreamResult<(PeerId, Hello)> {
    let ours = Message::new(ctx.chain_id, DEFAULT_MESSAGE_VERSION, protocol::HELLO, hello_for(ctx)?)?;
    if outbound {
        write_frame(writer, &ours.encode()).await?;
        let reply = read_message(reader, ctx.chain_id).await?;
        if reply.name() != protocol::OK {
            return Err(StreamError::Protocol(format!("expected ok, got {}", reply.name())));
        }
        let hello: Hello = protocol::decode(reply.data())?;
        let peer = check_hello(ctx, &hello, expected)?;
        Ok((peer, hello))
    } else {
        let first = read_message(reader, ctx.chain_id).await?;
        if first.name() != protocol::HELLO {
            return Err(StreamError::Protocol(format!("expected hello, got {}", first.name())));
        }
        let hello: Hello = protocol::decode(first.data())?;
        let peer = check_hello(ctx, &hello, expected)?;
        let ok = Message::new(ctx.chain_id, DEFAULT_MESSAGE_VERSION, protocol::OK, hello_for(ctx)?)?;
        write_frame(writer, &ok.encode()).await?;
        Ok((peer, hello))
    }
}

// ---------------------------------------------------------------------------
// Running a stream
// ---------------------------------------------------------------------------

/// Drive `socket` until it closes. Returns once the stream is gone; a
/// failed handshake returns its error without ever registering.
pub async fn run(
    ctx: Arc<NetContext>,
    socket: TcpStream,
    outbound: bool,
    expected: Option<PeerId>,
) -> StreamResult<()> {
    let addr = socket.peer_addr()?;
    let _ = socket.set_nodelay(true);
    let (mut reader, mut writer) = socket.into_split();

    let (peer, hello) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        handshake(&ctx, &mut reader, &mut writer, outbound, expected),
    )
    .await
    .map_err(|_| StreamError::HandshakeTimeout)??;

    let (high_tx, high_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (normal_tx, normal_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (low_tx, low_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
    let (quit_tx, quit_rx) = watch::channel(false);
    let now = now_ms();
    let handle = StreamHandle {
        shared: Arc::new(Shared {
            peer_id: peer,
            addr,
            outbound,
            chain_id: ctx.chain_id,
            queues: [high_tx, normal_tx, low_tx],
            established: AtomicBool::new(false),
            created_ms: now,
            last_active_ms: AtomicI64::new(now),
            quit: quit_tx,
        }),
    };

    if !ctx.manager.add(handle.clone()) {
        debug!(peer = %peer, "duplicate or surplus stream, closing");
        if let Ok(bye) = protocol::encode(&Bye {
            reason: "duplicate stream".into(),
        }) {
            if let Ok(m) = Message::new(ctx.chain_id, DEFAULT_MESSAGE_VERSION, protocol::BYE, bye) {
                let _ = write_frame(&mut writer, &m.encode()).await;
            }
        }
        return Ok(());
    }
    let addrs: Vec<Multiaddr> = hello
        .listen_addrs
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();
    ctx.route_table.add_peer(peer, addrs);
    handle.shared.established.store(true, Ordering::Release);
    debug!(peer = %peer, %addr, outbound, "stream established");

    let writer_task = tokio::spawn(write_loop(
        writer,
        [high_rx, normal_rx, low_rx],
        quit_rx.clone(),
        ctx.quit.clone(),
    ));
    let result = read_loop(&ctx, &handle, reader, quit_rx, ctx.quit.clone()).await;

    let _ = handle.shared.quit.send(true);
    let _ = writer_task.await;
    ctx.manager.remove(&peer, &handle);
    if !ctx.manager.contains(&peer) {
        ctx.route_table.remove_peer(&peer);
    }
    match &result {
        Ok(()) => debug!(peer = %peer, "stream closed"),
        Err(e) => warn!(peer = %peer, error = %e, "stream closed with error"),
    }
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    queues: [mpsc::Receiver<Bytes>; 3],
    mut quit: watch::Receiver<bool>,
    mut node_quit: watch::Receiver<bool>,
) {
    let [mut high, mut normal, mut low] = queues;
    loop {
        let frame = tokio::select! {
            biased;
            _ = quit.changed() => break,
            _ = node_quit.changed() => break,
            Some(f) = high.recv() => f,
            Some(f) = normal.recv() => f,
            Some(f) = low.recv() => f,
            else => break,
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            trace!(error = %e, "write failed");
            break;
        }
    }
    // Flush a pending goodbye if there is one.
    while let Ok(f) = high.try_recv() {
        if write_frame(&mut writer, &f).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    ctx: &NetContext,
    handle: &StreamHandle,
    mut reader: OwnedReadHalf,
    mut quit: watch::Receiver<bool>,
    mut node_quit: watch::Receiver<bool>,
) -> StreamResult<()> {
    let peer = handle.peer_id();
    loop {
        if handle.is_closed() {
            return Ok(());
        }
        let msg = tokio::select! {
            _ = quit.changed() => return Ok(()),
            _ = node_quit.changed() => return Ok(()),
            msg = read_message(&mut reader, ctx.chain_id) => msg?,
        };
        handle.touch();
        ctx.route_table.touch(&peer);
        trace!(peer = %peer, name = msg.name(), bytes = msg.data().len(), "message in");

        match msg.name() {
            protocol::HELLO | protocol::OK => {
                return Err(StreamError::Protocol(format!("{} after handshake", msg.name())));
            }
            protocol::BYE => {
                let reason = protocol::decode::<Bye>(msg.data())
                    .map(|b| b.reason)
                    .unwrap_or_default();
                debug!(peer = %peer, reason, "peer said bye");
                return Ok(());
            }
            protocol::SYNC_ROUTE => {
                let payload = ctx.route_table.payload_for(&peer);
                if let Err(e) = handle.send(protocol::ROUTE_TABLE, protocol::encode(&payload)?, Priority::Low) {
                    debug!(peer = %peer, error = %e, "route table reply dropped");
                }
            }
            protocol::ROUTE_TABLE => {
                let payload: RouteTablePayload = protocol::decode(msg.data())?;
                if payload.peers.len() > ctx.max_route_records {
                    return Err(StreamError::Protocol(format!(
                        "route table reply of {} peers, cap is {}",
                        payload.peers.len(),
                        ctx.max_route_records
                    )));
                }
                ctx.route_table.add_records(&payload.peers);
            }
            protocol::RECVED_MSG => {
                let ack: RecvedMsg = protocol::decode(msg.data())?;
                ctx.manager.recv_filter().insert(&peer, ack.checksum);
            }
            name => {
                if protocol::is_gossip(name) {
                    let checksum = msg.data_checksum();
                    // The sender has it; so do we once we ack.
                    ctx.manager.recv_filter().insert(&peer, checksum);
                    let ack = protocol::encode(&RecvedMsg { checksum })?;
                    let _ = handle.send(protocol::RECVED_MSG, ack, Priority::High);
                }
                ctx.dispatcher.put(peer, msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{NetworkConfig, CLIENT_VERSION};
    use crate::network::identity;
    use crate::network::protocol::PeerRecord;
    use crate::network::service::{to_socket_addr, NetService};

    const CHAIN_ID: u32 = 1;

    async fn listening_service(dir: &std::path::Path, max_route_records: usize) -> NetService {
        let config = NetworkConfig {
            listen: vec!["/ip4/127.0.0.1/tcp/0".into()],
            route_table_cache: dir.join("routes.cache"),
            max_peers_count_for_sync_resp: max_route_records,
            ..NetworkConfig::default()
        };
        let service = NetService::new(CHAIN_ID, config, &identity::generate().unwrap());
        service.start().await.unwrap();
        service
    }

    /// Raw client side of the handshake. Returns the split socket once the
    /// HELLO is written.
    async fn send_hello(service: &NetService, version: &str) -> (PeerId, OwnedReadHalf, OwnedWriteHalf) {
        let sock = to_socket_addr(&service.listen_addrs()[0]).unwrap();
        let (reader, mut writer) = TcpStream::connect(sock).await.unwrap().into_split();
        let peer = identity::generate().unwrap().public().to_peer_id();
        let hello = protocol::encode(&Hello {
            node_id: peer.to_base58(),
            client_version: version.to_string(),
            listen_addrs: Vec::new(),
        })
        .unwrap();
        let frame = Message::new(CHAIN_ID, DEFAULT_MESSAGE_VERSION, protocol::HELLO, hello).unwrap();
        write_frame(&mut writer, &frame.encode()).await.unwrap();
        (peer, reader, writer)
    }

    async fn send(writer: &mut OwnedWriteHalf, name: &str, data: Vec<u8>) {
        let frame = Message::new(CHAIN_ID, DEFAULT_MESSAGE_VERSION, name, data).unwrap();
        write_frame(writer, &frame.encode()).await.unwrap();
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    /// Reads until the server hangs up, skipping any frames it sends first.
    async fn closed_by_server(reader: &mut OwnedReadHalf) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, read_message(reader, CHAIN_ID)).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
        false
    }

    #[test]
    fn versions_must_match_exactly() {
        assert!(compatible("0.1.0", "0.1.0"));
        assert!(!compatible("0.1.0", "0.1.1"));
        assert!(!compatible("0.1.0", "0.9.3"));
        assert!(!compatible("0.1.0", ""));
    }

    #[tokio::test]
    async fn version_mismatch_closes_before_ok() {
        let dir = tempfile::tempdir().unwrap();
        let server = listening_service(dir.path(), 8).await;
        let (_, mut reader, _writer) = send_hello(&server, "0.1.1").await;

        // No OK ever arrives; the server drops the connection instead.
        assert!(read_message(&mut reader, CHAIN_ID).await.is_err());
        assert_eq!(server.peer_count(), 0);
        server.stop();
    }

    #[tokio::test]
    async fn oversized_route_table_reply_closes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let cap = 2;
        let server = listening_service(dir.path(), cap).await;
        let (peer, mut reader, mut writer) = send_hello(&server, CLIENT_VERSION).await;
        let ok = read_message(&mut reader, CHAIN_ID).await.unwrap();
        assert_eq!(ok.name(), protocol::OK);
        assert!(eventually(|| server.manager().contains(&peer)).await);

        let records: Vec<PeerRecord> = (0..=cap)
            .map(|i| PeerRecord {
                peer_id: identity::generate().unwrap().public().to_peer_id().to_base58(),
                addrs: vec![format!("/ip4/127.0.0.1/tcp/{}", 9000 + i)],
            })
            .collect();
        let payload = protocol::encode(&RouteTablePayload { peers: records.clone() }).unwrap();
        send(&mut writer, protocol::ROUTE_TABLE, payload).await;

        assert!(closed_by_server(&mut reader).await);
        assert!(eventually(|| !server.manager().contains(&peer)).await);
        for record in &records {
            assert!(!server.route_table().contains(&record.peer_id.parse().unwrap()));
        }
        server.stop();
    }

    #[tokio::test]
    async fn route_table_reply_within_cap_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let server = listening_service(dir.path(), 2).await;
        let (peer, mut reader, mut writer) = send_hello(&server, CLIENT_VERSION).await;
        read_message(&mut reader, CHAIN_ID).await.unwrap();
        assert!(eventually(|| server.manager().contains(&peer)).await);

        let learned = identity::generate().unwrap().public().to_peer_id();
        let payload = protocol::encode(&RouteTablePayload {
            peers: vec![PeerRecord {
                peer_id: learned.to_base58(),
                addrs: vec!["/ip4/127.0.0.1/tcp/9100".into()],
            }],
        })
        .unwrap();
        send(&mut writer, protocol::ROUTE_TABLE, payload).await;

        assert!(eventually(|| server.route_table().contains(&learned)).await);
        assert!(server.manager().contains(&peer));
        server.stop();
    }

    #[tokio::test]
    async fn closed_stream_leaves_route_table() {
        let dir = tempfile::tempdir().unwrap();
        let server = listening_service(dir.path(), 8).await;
        let (peer, mut reader, mut writer) = send_hello(&server, CLIENT_VERSION).await;
        read_message(&mut reader, CHAIN_ID).await.unwrap();
        assert!(eventually(|| server.route_table().contains(&peer)).await);

        let bye = protocol::encode(&Bye { reason: "done".into() }).unwrap();
        send(&mut writer, protocol::BYE, bye).await;

        assert!(eventually(|| !server.manager().contains(&peer)).await);
        assert!(eventually(|| !server.route_table().contains(&peer)).await);
        server.stop();
    }
}
