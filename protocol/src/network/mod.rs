//! # Network Module
//!
//! Peer-to-peer transport for blocks, transactions, witnesses and chain
//! sync. Peers are identified by libp2p peer ids; the transport itself is
//! plain TCP carrying length-prefixed, checksummed frames.
//!
//! ## Architecture
//!
//! ```text
//! message.rs      36-byte header framing and validation
//! protocol.rs     message names, priorities, control payloads
//! stream.rs       one connection: handshake, priority write queues, read loop
//! manager.rs      stream registry, broadcast/relay, filtered sends, cleanup
//! route_table.rs  Kademlia buckets, peer cache file, internal nodes
//! recv_filter.rs  Bloom filter of peers known to hold a payload
//! dispatcher.rs   inbound routing to subscribers by message name
//! identity.rs     node key file
//! service.rs      listeners, background tasks, Broadcaster impl
//! ```
//!
//! ## Data flow
//!
//! Inbound frames are checked by the stream, control messages (HELLO, BYE,
//! route sync, receipt acks) are handled there, and everything else goes
//! through the dispatcher to whoever subscribed. Outbound traffic goes
//! through [`Broadcaster`], which the transaction pool, block pool and
//! consensus engine hold as a trait object so they never see streams.

pub mod dispatcher;
pub mod identity;
pub mod manager;
pub mod message;
pub mod protocol;
pub mod recv_filter;
pub mod route_table;
pub mod service;
pub mod stream;

pub use dispatcher::{InboundMessage, NetDispatcher};
pub use manager::{PeerFilter, StreamManager};
pub use message::{Message, MessageError, MessageHeader, MessageResult};
pub use protocol::{
    Priority, CHAIN_CHUNKS, CHAIN_CHUNK_DATA, CHAIN_GET_CHUNK, CHAIN_SYNC, NEW_BLOCK, NEW_TX,
    WITNESS,
};
pub use route_table::{PeerInfo, RouteTable};
pub use service::NetService;
pub use stream::{StreamError, StreamHandle, StreamResult};

/// Outbound gossip, as seen by everything above the network layer.
pub trait Broadcaster: Send + Sync {
    /// Send to every connected peer.
    fn broadcast(&self, name: &str, data: Vec<u8>, priority: Priority);

    /// Send to every connected peer not already known to hold `data`.
    fn relay(&self, name: &str, data: Vec<u8>, priority: Priority);
}
