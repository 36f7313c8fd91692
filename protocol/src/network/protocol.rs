//! Message names, priorities and control payloads.
//!
//! Payloads are bincode. Chain-sync payloads live with the sync service and
//! the witness payload with the consensus engine; this module only knows
//! their names.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::message::{MessageError, MessageResult};

pub const HELLO: &str = "hello";
pub const OK: &str = "ok";
pub const BYE: &str = "bye";
pub const SYNC_ROUTE: &str = "syncroute";
pub const ROUTE_TABLE: &str = "routetable";
pub const RECVED_MSG: &str = "recvedmsg";
pub const WITNESS: &str = "witness";
// The chain-sync names on the wire are short forms; the long ones do not
// fit the 12-byte name field.
pub const CHAIN_SYNC: &str = "sync";
pub const CHAIN_CHUNKS: &str = "chunkheaders";
pub const CHAIN_GET_CHUNK: &str = "getchunk";
pub const CHAIN_CHUNK_DATA: &str = "chunkdata";
pub const NEW_BLOCK: &str = "newblock";
pub const NEW_TX: &str = "newtx";

/// Send queue of a stream. Lower value drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Default priority for a message name.
    pub fn of(name: &str) -> Self {
        match name {
            HELLO | OK | BYE | RECVED_MSG => Priority::High,
            NEW_BLOCK | NEW_TX | WITNESS => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Names that are gossip and therefore de-duplicated and acknowledged
/// with `recvedmsg`.
pub fn is_gossip(name: &str) -> bool {
    matches!(name, NEW_BLOCK | NEW_TX | WITNESS)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Base58 peer id of the sender.
    pub node_id: String,
    pub client_version: String,
    pub listen_addrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteTablePayload {
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvedMsg {
    pub checksum: u32,
}

pub fn encode<T: Serialize>(value: &T) -> MessageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| MessageError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MessageResult<T> {
    bincode::deserialize(bytes).map_err(|e| MessageError::Codec(e.to_string()))
}
