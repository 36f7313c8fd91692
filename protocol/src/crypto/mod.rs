//! # Cryptographic Primitives
//!
//! Thin, typed wrappers over audited implementations:
//!
//! - **BLAKE3** for every content address ([`Hash`]).
//! - **SHA-256** for Kademlia distance keys.
//! - **Ed25519** for block, transaction and witness signatures.
//! - A signature-based **VRF** for block randomness.
//!
//! Nothing in here invents cryptography; if a function looks clever, it is
//! a bug.

pub mod address;
pub mod hash;
pub mod keys;
pub mod vrf;

pub use address::{Address, AddressType};
pub use hash::{blake3_hash, blake3_hash_many, fnv32a, sha256_array, Hash};
pub use keys::{recover_signer, KeyError, Keypair, PublicKey, Signature, SignatureAlgorithm};
