//! # Network Service
//!
//! Owns the listeners, the stream manager, the route table and the inbound
//! dispatcher, and is the [`Broadcaster`] the rest of the node talks to.
//!
//! ## Background tasks
//!
//! ```text
//! accept loop (per listener)   inbound TCP  ─► stream::run
//! dispatcher                   inbound queue ─► subscribers
//! stream cleanup               every 30 s
//! route sync                   syncroute to seeds + random peers, dial unknown ones
//! route save                   write the cache file when the table changed
//! ```
//!
//! Every task watches the service quit channel; [`NetService::stop`] ends
//! them and says BYE on every stream.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::dispatcher::NetDispatcher;
use super::identity;
use super::manager::{PeerFilter, StreamManager};
use super::protocol::{self, Priority};
use super::route_table::{parse_peer_line, RouteTable};
use super::stream::{self, StreamError, StreamResult};
use super::Broadcaster;
use crate::config::{NetworkConfig, HANDSHAKE_TIMEOUT};

/// What a stream needs from its node.
pub struct NetContext {
    pub(crate) chain_id: u32,
    pub(crate) client_version: String,
    pub(crate) local_peer: PeerId,
    listen: RwLock<Vec<Multiaddr>>,
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) route_table: Arc<RouteTable>,
    pub(crate) dispatcher: Arc<NetDispatcher>,
    /// Largest `routetable` reply accepted from a peer.
    pub(crate) max_route_records: usize,
    pub(crate) quit: watch::Receiver<bool>,
}

impl NetContext {
    pub(crate) fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.read().clone()
    }
}

pub fn to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for p in addr.iter() {
        match p {
            Protocol::Ip4(a) => ip = Some(IpAddr::V4(a)),
            Protocol::Ip6(a) => ip = Some(IpAddr::V6(a)),
            Protocol::Tcp(p) => port = Some(p),
            _ => {}
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

pub fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let mut out = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => out.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => out.push(Protocol::Ip6(ip)),
    }
    out.push(Protocol::Tcp(addr.port()));
    out
}

pub struct NetService {
    ctx: Arc<NetContext>,
    config: NetworkConfig,
    seeds: Vec<(Multiaddr, PeerId)>,
    dialing: Arc<DashSet<PeerId>>,
    quit: watch::Sender<bool>,
}

impl NetService {
    pub fn new(chain_id: u32, config: NetworkConfig, keypair: &Keypair) -> Self {
        let local_peer = keypair.public().to_peer_id();
        let (quit, quit_rx) = watch::channel(false);
        let ctx = NetContext {
            chain_id,
            client_version: config.client_version.clone(),
            local_peer,
            listen: RwLock::new(Vec::new()),
            manager: Arc::new(StreamManager::new(config.max_streams)),
            route_table: Arc::new(RouteTable::new(
                local_peer,
                config.bucket_size,
                config.max_peers_count_for_sync_resp,
            )),
            dispatcher: Arc::new(NetDispatcher::new()),
            max_route_records: config.max_peers_count_for_sync_resp,
            quit: quit_rx,
        };
        let seeds = config
            .seeds
            .iter()
            .filter_map(|seed| {
                let parsed = parse_peer_line(seed);
                if parsed.is_none() {
                    warn!(seed, "unparsable seed address");
                }
                parsed
            })
            .collect();
        Self {
            ctx: Arc::new(ctx),
            config,
            seeds,
            dialing: Arc::new(DashSet::new()),
            quit,
        }
    }

    /// Build from config, loading (or creating) the identity key file.
    pub fn from_config(chain_id: u32, config: NetworkConfig) -> StreamResult<Self> {
        let keypair = identity::load_or_generate(&config.private_key)?;
        Ok(Self::new(chain_id, config, &keypair))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.ctx.local_peer
    }

    pub fn chain_id(&self) -> u32 {
        self.ctx.chain_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<StreamManager> {
        &self.ctx.manager
    }

    pub fn route_table(&self) -> &Arc<RouteTable> {
        &self.ctx.route_table
    }

    pub fn dispatcher(&self) -> &Arc<NetDispatcher> {
        &self.ctx.dispatcher
    }

    /// Addresses actually bound, available after [`start`](Self::start).
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.ctx.listen_addrs()
    }

    pub fn peer_count(&self) -> usize {
        self.ctx.manager.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.ctx.manager.peers()
    }

    /// Bind listeners, load known peers and start every background task.
    pub async fn start(&self) -> StreamResult<()> {
        if let Some(path) = &self.config.internal_node_list {
            let n = self.ctx.route_table.load_internal_nodes(path)?;
            info!(count = n, "internal nodes loaded");
        }
        if let Err(e) = self.ctx.route_table.load_cache(&self.config.route_table_cache) {
            warn!(error = %e, "route table cache unreadable, starting empty");
        }

        let mut bound = Vec::new();
        for raw in &self.config.listen {
            let addr: Multiaddr = raw
                .parse()
                .map_err(|_| StreamError::Address(raw.clone()))?;
            let sock = to_socket_addr(&addr).ok_or_else(|| StreamError::Address(raw.clone()))?;
            let listener = TcpListener::bind(sock).await?;
            let local = listener.local_addr()?;
            info!(addr = %local, peer = %self.ctx.local_peer, "listening");
            bound.push(to_multiaddr(local));
            tokio::spawn(accept_loop(listener, self.ctx.clone()));
        }
        *self.ctx.listen.write() = bound;

        tokio::spawn(self.ctx.dispatcher.clone().run(self.quit.subscribe()));
        tokio::spawn(self.ctx.manager.clone().run_cleanup(self.quit.subscribe()));
        tokio::spawn(route_sync_loop(
            self.ctx.clone(),
            self.dialing.clone(),
            self.seeds.clone(),
            self.config.max_sync_nodes,
            Duration::from_secs(self.config.route_table_sync_interval_secs.max(1)),
        ));
        tokio::spawn(route_save_loop(
            self.ctx.route_table.clone(),
            self.config.route_table_cache.clone(),
            Duration::from_secs(self.config.route_table_save_interval_secs.max(1)),
            self.quit.subscribe(),
        ));

        for (addr, peer) in &self.seeds {
            self.ctx.route_table.add_peer(*peer, vec![addr.clone()]);
            spawn_dial(self.ctx.clone(), self.dialing.clone(), addr.clone(), Some(*peer));
        }
        Ok(())
    }

    /// Dial `addr` and run the stream in the background.
    pub fn connect(&self, addr: Multiaddr, expected: Option<PeerId>) {
        spawn_dial(self.ctx.clone(), self.dialing.clone(), addr, expected);
    }

    /// Wait until at least `n` streams are established.
    pub async fn wait_for_peers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.ctx.manager.peers().len() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.ctx.manager.peers().len() >= n
    }

    pub fn send_to(&self, peer: &PeerId, name: &str, data: Vec<u8>, priority: Priority) -> StreamResult<()> {
        self.ctx.manager.send_to(peer, name, Bytes::from(data), priority)
    }

    /// Send to the peers picked by `filter`; see
    /// [`StreamManager::send_message_to_peers`].
    pub fn send_message_to_peers(
        &self,
        name: &str,
        data: Vec<u8>,
        priority: Priority,
        filter: PeerFilter,
    ) -> Vec<PeerId> {
        self.ctx
            .manager
            .send_message_to_peers(name, Bytes::from(data), priority, filter)
    }

    /// Stop background tasks, say goodbye to every peer and save the cache.
    pub fn stop(&self) {
        self.ctx.manager.close_all("shutdown");
        let _ = self.quit.send(true);
        if let Err(e) = self.ctx.route_table.save_cache(&self.config.route_table_cache) {
            warn!(error = %e, "route table not saved");
        }
        info!("network stopped");
    }
}

impl Broadcaster for NetService {
    fn broadcast(&self, name: &str, data: Vec<u8>, priority: Priority) {
        let sent = self.ctx.manager.broadcast(name, Bytes::from(data), priority);
        debug!(name, sent, "broadcast");
    }

    fn relay(&self, name: &str, data: Vec<u8>, priority: Priority) {
        let sent = self.ctx.manager.relay(name, Bytes::from(data), priority);
        debug!(name, sent, "relay");
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, ctx: Arc<NetContext>) {
    let mut quit = ctx.quit.clone();
    loop {
        let accepted = tokio::select! {
            _ = quit.changed() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((socket, remote)) => {
                debug!(%remote, "inbound connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = stream::run(ctx, socket, false, None).await {
                        debug!(%remote, error = %e, "inbound stream ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn spawn_dial(ctx: Arc<NetContext>, dialing: Arc<DashSet<PeerId>>, addr: Multiaddr, expected: Option<PeerId>) {
    if let Some(peer) = expected {
        if peer == ctx.local_peer || ctx.manager.contains(&peer) || !dialing.insert(peer) {
            return;
        }
    }
    tokio::spawn(async move {
        let result = dial(ctx.clone(), &addr, expected).await;
        if let Some(peer) = expected {
            dialing.remove(&peer);
            if let Err(e) = &result {
                debug!(%peer, %addr, error = %e, "dial failed");
                if !matches!(e, StreamError::Protocol(_)) {
                    ctx.route_table.remove_peer(&peer);
                }
            }
        }
    });
}

async fn dial(ctx: Arc<NetContext>, addr: &Multiaddr, expected: Option<PeerId>) -> StreamResult<()> {
    let sock = to_socket_addr(addr).ok_or_else(|| StreamError::Address(addr.to_string()))?;
    let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(sock))
        .await
        .map_err(|_| StreamError::HandshakeTimeout)??;
    stream::run(ctx, socket, true, expected).await
}

/// Ask the seeds and up to `max_sync_nodes / 2` random connected peers for
/// their neighbours, then dial the closest peers we are not yet connected
/// to. Seeds that are down get redialed. Returns the peers asked.
fn sync_routes(
    ctx: &Arc<NetContext>,
    dialing: &Arc<DashSet<PeerId>>,
    seeds: &[(Multiaddr, PeerId)],
    max_sync_nodes: usize,
) -> Vec<PeerId> {
    let mut targets = Vec::new();
    for (addr, peer) in seeds {
        if ctx.manager.contains(peer) {
            targets.push(*peer);
        } else {
            spawn_dial(ctx.clone(), dialing.clone(), addr.clone(), Some(*peer));
        }
    }
    let seed_targets = targets.clone();
    targets.extend(ctx.route_table.random_peers(max_sync_nodes / 2, |p| {
        ctx.manager.contains(p) && !seed_targets.contains(p)
    }));
    targets.retain(|peer| {
        match ctx
            .manager
            .send_to(peer, protocol::SYNC_ROUTE, Bytes::new(), Priority::Low)
        {
            Ok(()) => true,
            Err(e) => {
                debug!(%peer, error = %e, "syncroute not sent");
                false
            }
        }
    });

    let room = ctx.manager.max_streams().saturating_sub(ctx.manager.len());
    let candidates = ctx
        .route_table
        .nearest(&ctx.local_peer, ctx.route_table.len())
        .into_iter()
        .filter(|p| !ctx.manager.contains(&p.peer_id))
        .take(room);
    for info in candidates {
        if let Some(addr) = info.addrs.first() {
            spawn_dial(ctx.clone(), dialing.clone(), addr.clone(), Some(info.peer_id));
        }
    }
    targets
}

async fn route_sync_loop(
    ctx: Arc<NetContext>,
    dialing: Arc<DashSet<PeerId>>,
    seeds: Vec<(Multiaddr, PeerId)>,
    max_sync_nodes: usize,
    every: Duration,
) {
    let mut quit = ctx.quit.clone();
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            _ = tick.tick() => {
                let asked = sync_routes(&ctx, &dialing, &seeds, max_sync_nodes);
                debug!(asked = asked.len(), known = ctx.route_table.len(), "route sync");
            }
        }
    }
}

async fn route_save_loop(
    table: Arc<RouteTable>,
    path: std::path::PathBuf,
    every: Duration,
    mut quit: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = quit.changed() => break,
            _ = tick.tick() => {
                match table.save_cache_if_dirty(&path) {
                    Ok(true) => debug!(path = %path.display(), peers = table.len(), "route table saved"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "route table save failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &std::path::Path, seeds: Vec<String>) -> NetService {
        let config = NetworkConfig {
            listen: vec!["/ip4/127.0.0.1/tcp/0".into()],
            seeds,
            route_table_cache: dir.join("routes.cache"),
            ..NetworkConfig::default()
        };
        NetService::new(1, config, &identity::generate().unwrap())
    }

    #[test]
    fn socket_addresses_map_to_multiaddrs() {
        let sock: SocketAddr = "127.0.0.1:8680".parse().unwrap();
        let ma = to_multiaddr(sock);
        assert_eq!(ma.to_string(), "/ip4/127.0.0.1/tcp/8680");
        assert_eq!(to_socket_addr(&ma), Some(sock));
        assert_eq!(to_socket_addr(&"/ip4/1.2.3.4".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn seed_connection_and_gossip() {
        let dir = tempfile::tempdir().unwrap();
        let a = service(dir.path(), Vec::new());
        a.start().await.unwrap();
        let seed = super::super::route_table::join_peer_addr(&a.listen_addrs()[0], a.local_peer_id());

        let b = service(&dir.path().join("b"), vec![seed]);
        let mut blocks = a.dispatcher().subscribe(&[protocol::NEW_BLOCK], 8);
        b.start().await.unwrap();

        assert!(a.wait_for_peers(1, Duration::from_secs(5)).await);
        assert!(b.wait_for_peers(1, Duration::from_secs(5)).await);
        assert!(a.route_table().contains(&b.local_peer_id()));

        b.broadcast(protocol::NEW_BLOCK, b"block".to_vec(), Priority::Normal);
        let got = tokio::time::timeout(Duration::from_secs(5), blocks.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, b.local_peer_id());
        assert_eq!(&got.data[..], b"block");

        a.stop();
        b.stop();
    }

    async fn star(dir: &std::path::Path) -> (NetService, NetService, NetService) {
        let hub = service(dir, Vec::new());
        hub.start().await.unwrap();
        let seed = super::super::route_table::join_peer_addr(&hub.listen_addrs()[0], hub.local_peer_id());
        let b = service(&dir.join("b"), vec![seed.clone()]);
        let c = service(&dir.join("c"), vec![seed]);
        b.start().await.unwrap();
        c.start().await.unwrap();
        assert!(hub.wait_for_peers(2, Duration::from_secs(5)).await);
        assert!(b.wait_for_peers(1, Duration::from_secs(5)).await);
        assert!(c.wait_for_peers(1, Duration::from_secs(5)).await);
        (hub, b, c)
    }

    #[tokio::test]
    async fn broadcast_skips_peers_that_acked_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, b, c) = star(dir.path()).await;

        hub.manager()
            .recv_filter()
            .insert(&b.local_peer_id(), crc32fast::hash(b"block"));
        let block = Bytes::from_static(b"block");
        assert_eq!(hub.manager().broadcast(protocol::NEW_BLOCK, block, Priority::Normal), 1);

        for peer in [b.local_peer_id(), c.local_peer_id()] {
            hub.manager().recv_filter().insert(&peer, crc32fast::hash(b"tx"));
        }
        let tx = Bytes::from_static(b"tx");
        assert_eq!(hub.manager().relay(protocol::NEW_TX, tx, Priority::Normal), 0);

        hub.manager()
            .recv_filter()
            .insert(&c.local_peer_id(), crc32fast::hash(b"block"));
        let block = Bytes::from_static(b"block");
        assert_eq!(hub.manager().broadcast(protocol::NEW_BLOCK, block, Priority::Normal), 0);
        let other = Bytes::from_static(b"other block");
        assert_eq!(hub.manager().broadcast(protocol::NEW_BLOCK, other, Priority::Normal), 2);

        hub.stop();
        b.stop();
        c.stop();
    }

    #[tokio::test]
    async fn route_sync_asks_seeds_and_half_the_sync_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, b, c) = star(dir.path()).await;

        // No seeds of its own: one random peer out of two.
        let asked = sync_routes(&hub.ctx, &hub.dialing, &hub.seeds, 2);
        assert_eq!(asked.len(), 1);
        assert!(asked[0] == b.local_peer_id() || asked[0] == c.local_peer_id());

        // The seed is always asked, and is not counted twice.
        let asked = sync_routes(&b.ctx, &b.dialing, &b.seeds, 64);
        assert_eq!(asked, vec![hub.local_peer_id()]);

        hub.stop();
        b.stop();
        c.stop();
    }

    #[tokio::test]
    async fn filtered_send_reports_dispatched_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, b, c) = star(dir.path()).await;
        let spokes = [b.local_peer_id(), c.local_peer_id()];

        let mut all = hub.send_message_to_peers(protocol::CHAIN_SYNC, b"x".to_vec(), Priority::Low, PeerFilter::All);
        all.sort_by_key(|p| p.to_bytes());
        let mut expected = spokes.to_vec();
        expected.sort_by_key(|p| p.to_bytes());
        assert_eq!(all, expected);

        let one = hub.send_message_to_peers(
            protocol::CHAIN_SYNC,
            b"x".to_vec(),
            Priority::Low,
            PeerFilter::ChainSync(1),
        );
        assert_eq!(one.len(), 1);
        assert!(spokes.contains(&one[0]));
        assert!(hub
            .send_message_to_peers(protocol::CHAIN_SYNC, b"x".to_vec(), Priority::Low, PeerFilter::Random(0))
            .is_empty());

        hub.stop();
        b.stop();
        c.stop();
    }

    #[tokio::test]
    async fn chain_id_mismatch_never_establishes() {
        let dir = tempfile::tempdir().unwrap();
        let a = service(dir.path(), Vec::new());
        a.start().await.unwrap();

        let config = NetworkConfig {
            listen: vec!["/ip4/127.0.0.1/tcp/0".into()],
            route_table_cache: dir.path().join("other.cache"),
            ..NetworkConfig::default()
        };
        let other = NetService::new(2, config, &identity::generate().unwrap());
        other.start().await.unwrap();
        other.connect(a.listen_addrs()[0].clone(), Some(a.local_peer_id()));

        assert!(!a.wait_for_peers(1, Duration::from_millis(500)).await);
        assert_eq!(other.peer_count(), 0);
        a.stop();
        other.stop();
    }
}
