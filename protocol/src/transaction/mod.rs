//! # Transaction Module
//!
//! Construction, signing, verification and pooling of transactions.
//!
//! ## Architecture
//!
//! ```text
//! types.rs  : Transaction, PayloadType, TxError
//! builder.rs: fluent TransactionBuilder
//! pool.rs   : gas-price ordered pool on a min-max heap
//! ```
//!
//! ## Transaction Lifecycle
//!
//! 1. **Build** with [`TransactionBuilder`] and sign with the sender's key.
//! 2. **Submit** to the [`TxPool`], which verifies and gossips it.
//! 3. **Execute** when a proposer pops it into a block
//!    ([`crate::chain::executor`]).
//! 4. **Prune** from every pool once the block carrying it is applied.

pub mod builder;
pub mod pool;
pub mod types;

pub use builder::TransactionBuilder;
pub use pool::{AccountNonces, TxPool};
pub use types::{PayloadType, ProtocolPayload, Transaction, TxError, TxResult};
