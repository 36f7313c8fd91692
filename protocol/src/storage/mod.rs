//! # Storage Module
//!
//! Everything below the state engine that touches bytes at rest.
//!
//! ## Architecture
//!
//! ```text
//! kv.rs               : Storage trait, per-caller write batches, in-memory backend
//! db.rs               : sled backend (node default)
//! cached.rs           : write-through LRU layer over any backend
//! trie.rs             : Merkle Patricia trie stored in a backend
//! persistable_cache.rs: cache with snapshot + inc-log journal on disk
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! MVCC commit → TrieStorage → Trie → CachedStorage → SledStorage
//!                                        (nodes by hash)
//! ```
//!
//! Blocks and chain metadata go straight to the backend under prefixed
//! keys; account state goes through the trie so every block carries a
//! state root.

pub mod cached;
pub mod db;
pub mod kv;
pub mod persistable_cache;
pub mod trie;

pub use cached::CachedStorage;
pub use db::SledStorage;
pub use kv::{get_opt, MemoryStorage, Storage, StorageError, StorageResult, WriteBatch};
pub use persistable_cache::{CacheBackend, CacheError, LruBackend, PersistableCache};
pub use trie::{Trie, TrieError, TrieIterator, TrieResult};
