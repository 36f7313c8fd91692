// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PoD Protocol: Core Library
//!
//! The core of a Proof-of-Devotion chain: a committee of miners (the
//! dynasty) takes turns sealing blocks in fixed slots, transactions inside
//! a block execute in parallel over multi-version state, and nodes gossip
//! over a small framed TCP protocol.
//!
//! ## Architecture
//!
//! - **config**: Canonical constants and the node's TOML configuration.
//! - **crypto**: Hashes, addresses, Ed25519 keys, the block VRF.
//! - **util**: Byte codec, min-max heap, execution DAG and its dispatcher.
//! - **storage**: Key-value backends, the Merkle trie, the persistable cache.
//! - **mvcc**: Versioned staging tables with dependency tracking.
//! - **transaction**: Transactions, their builder, and the pending pool.
//! - **chain**: Blocks, world state, execution, the canonical chain and
//!   the block pool that writes it.
//! - **consensus**: Dynasties, slot minting, fork choice and finality.
//! - **network**: Streams, routing, gossip and the message dispatcher.
//! - **sync**: Chunked catch-up from peers.
//!
//! ## Flow of a block
//!
//! ```text
//! mint loop ──► Executor::produce ──► seal + sign ──► BlockPool ──► newblock
//!                                                        ▲
//! newblock / chunk sync ─────────────────────────────────┘
//!   BlockPool: verify (consensus) ─► replay (DAG) ─► store ─► fork choice ─► LIB
//! ```

pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod mvcc;
pub mod network;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod util;
