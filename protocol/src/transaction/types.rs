//! Core transaction type.
//!
//! A transaction moves `value` from `from` to `to` and optionally carries a
//! typed payload. The hash covers every field except the signature; the
//! signature covers the hash and carries the signer's public key, so the
//! signer address can be recovered and compared to `from`.

use std::fmt;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::config::{MAX_GAS_LIMIT, MAX_TX_PAYLOAD_BYTES, MIN_GAS_PRICE, TRANSFER_GAS};
use crate::crypto::{
    blake3_hash_many, recover_signer, Address, Hash, KeyError, Keypair, PublicKey, Signature,
    SignatureAlgorithm,
};

/// Gas charged per payload byte on top of [`TRANSFER_GAS`].
pub const PAYLOAD_GAS_PER_BYTE: u64 = 1;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("chain id {got} does not match {expected}")]
    InvalidChainId { expected: u32, got: u32 },

    #[error("transaction hash does not match its contents")]
    InvalidHash,

    #[error("transaction is not signed")]
    Unsigned,

    #[error("signer {signer} is not the sender {from}")]
    SignerMismatch { signer: Address, from: Address },

    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    #[error("gas price below the minimum")]
    GasPriceTooLow,

    #[error("gas limit out of range")]
    InvalidGasLimit,

    #[error("nonce {got} is not above the committed nonce {committed}")]
    NonceTooLow { committed: u64, got: u64 },

    #[error("nonce {got} leaves a gap after {expected}")]
    NonceTooHigh { expected: u64, got: u64 },

    #[error("balance too low")]
    InsufficientBalance,

    #[error("transaction already known")]
    Duplicate,

    #[error("transaction pool is full")]
    PoolFull,

    #[error("payload type {0} has no executor")]
    UnsupportedPayload(PayloadType),

    #[error("transaction codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

pub type TxResult<T> = Result<T, TxError>;

// ---------------------------------------------------------------------------
// PayloadType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    /// Plain value transfer; payload is free-form data.
    Binary,
    /// Contract deployment.
    Deploy,
    /// Contract call.
    Call,
    /// Chain-internal messages such as miner heartbeats.
    Protocol,
    /// Governance vote.
    Vote,
}

impl PayloadType {
    fn tag(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Deploy => 1,
            Self::Call => 2,
            Self::Protocol => 3,
            Self::Vote => 4,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Deploy => write!(f, "deploy"),
            Self::Call => write!(f, "call"),
            Self::Protocol => write!(f, "protocol"),
            Self::Vote => write!(f, "vote"),
        }
    }
}

/// Body of a `Protocol` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolPayload {
    /// A dynasty participant announcing it is alive for `serial`.
    Heartbeat { serial: u64 },
}

impl ProtocolPayload {
    pub fn encode(&self) -> TxResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TxError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> TxResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TxError::Codec(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub chain_id: u32,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    /// Seconds since the epoch.
    pub timestamp: i64,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub alg: SignatureAlgorithm,
    pub signer: Option<PublicKey>,
    pub signature: Signature,
}

impl Transaction {
    /// Unsigned transaction; [`sign`](Self::sign) fills in the hash.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u32,
        from: Address,
        to: Address,
        value: U256,
        nonce: u64,
        payload_type: PayloadType,
        payload: Vec<u8>,
        gas_price: U256,
        gas_limit: U256,
    ) -> TxResult<Self> {
        if payload.len() > MAX_TX_PAYLOAD_BYTES {
            return Err(TxError::PayloadTooLarge(payload.len()));
        }
        let mut tx = Self {
            hash: Hash::ZERO,
            chain_id,
            from,
            to,
            value,
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
            payload_type,
            payload,
            gas_price,
            gas_limit,
            alg: SignatureAlgorithm::Ed25519,
            signer: None,
            signature: Signature::default(),
        };
        tx.hash = tx.calculate_hash();
        Ok(tx)
    }

    pub fn calculate_hash(&self) -> Hash {
        let value = u256_bytes(&self.value);
        let gas_price = u256_bytes(&self.gas_price);
        let gas_limit = u256_bytes(&self.gas_limit);
        blake3_hash_many(&[
            &self.chain_id.to_be_bytes(),
            &self.from.to_bytes(),
            &self.to.to_bytes(),
            &value,
            &self.nonce.to_be_bytes(),
            &self.timestamp.to_be_bytes(),
            &[self.payload_type.tag()],
            &(self.payload.len() as u64).to_be_bytes(),
            &self.payload,
            &gas_price,
            &gas_limit,
            &[u8::from(self.alg)],
        ])
    }

    /// Sign with `keypair`, which must control `from`.
    pub fn sign(&mut self, keypair: &Keypair) -> TxResult<()> {
        let signer = keypair.address();
        if signer != self.from {
            return Err(TxError::SignerMismatch {
                signer,
                from: self.from,
            });
        }
        self.hash = self.calculate_hash();
        self.signature = keypair.sign(self.hash.as_bytes());
        self.signer = Some(keypair.public_key());
        Ok(())
    }

    /// Stateless checks: chain id, hash, signature, gas bounds.
    pub fn verify_integrity(&self, chain_id: u32) -> TxResult<()> {
        if self.chain_id != chain_id {
            return Err(TxError::InvalidChainId {
                expected: chain_id,
                got: self.chain_id,
            });
        }
        if self.payload.len() > MAX_TX_PAYLOAD_BYTES {
            return Err(TxError::PayloadTooLarge(self.payload.len()));
        }
        if self.hash != self.calculate_hash() {
            return Err(TxError::InvalidHash);
        }
        if self.gas_price < U256::from(MIN_GAS_PRICE) {
            return Err(TxError::GasPriceTooLow);
        }
        if self.gas_limit < U256::from(self.intrinsic_gas())
            || self.gas_limit > U256::from(MAX_GAS_LIMIT)
        {
            return Err(TxError::InvalidGasLimit);
        }
        let signer_key = self.signer.as_ref().ok_or(TxError::Unsigned)?;
        let signer = recover_signer(self.alg, signer_key, self.hash.as_bytes(), &self.signature)?;
        if signer != self.from {
            return Err(TxError::SignerMismatch {
                signer,
                from: self.from,
            });
        }
        Ok(())
    }

    /// Gas every transaction pays before its payload runs.
    pub fn intrinsic_gas(&self) -> u64 {
        TRANSFER_GAS + self.payload.len() as u64 * PAYLOAD_GAS_PER_BYTE
    }

    /// Upper bound of what the sender may pay: `value + gas_price * gas_limit`.
    pub fn max_cost(&self) -> Option<U256> {
        self.gas_price
            .checked_mul(self.gas_limit)
            .and_then(|fee| fee.checked_add(self.value))
    }

    pub fn encode(&self) -> TxResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TxError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> TxResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TxError::Codec(e.to_string()))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx {} {} -> {} nonce={} value={} type={}",
            self.hash, self.from, self.to, self.nonce, self.value, self.payload_type
        )
    }
}

pub(crate) fn u256_bytes(v: &U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    v.to_big_endian(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(kp: &Keypair, nonce: u64) -> Transaction {
        let mut tx = Transaction::new(
            100,
            kp.address(),
            Keypair::generate().address(),
            U256::from(10u64),
            nonce,
            PayloadType::Binary,
            Vec::new(),
            U256::from(MIN_GAS_PRICE),
            U256::from(TRANSFER_GAS),
        )
        .unwrap();
        tx.sign(kp).unwrap();
        tx
    }

    #[test]
    fn signed_transaction_verifies() {
        let kp = Keypair::generate();
        let tx = transfer(&kp, 1);
        tx.verify_integrity(100).unwrap();
        assert!(matches!(
            tx.verify_integrity(101),
            Err(TxError::InvalidChainId { .. })
        ));
    }

    #[test]
    fn tampering_breaks_the_hash() {
        let kp = Keypair::generate();
        let mut tx = transfer(&kp, 1);
        tx.value = U256::from(1_000_000u64);
        assert!(matches!(tx.verify_integrity(100), Err(TxError::InvalidHash)));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let kp = Keypair::generate();
        let mut tx = transfer(&kp, 1);
        let other = Keypair::generate();
        tx.signature = other.sign(tx.hash.as_bytes());
        tx.signer = Some(other.public_key());
        assert!(matches!(
            tx.verify_integrity(100),
            Err(TxError::SignerMismatch { .. })
        ));
        assert!(tx.sign(&other).is_err());
    }

    #[test]
    fn unsigned_transaction_is_rejected() {
        let kp = Keypair::generate();
        let mut tx = transfer(&kp, 1);
        tx.signer = None;
        assert!(matches!(tx.verify_integrity(100), Err(TxError::Unsigned)));
    }

    #[test]
    fn gas_bounds_are_enforced() {
        let kp = Keypair::generate();
        let mut tx = transfer(&kp, 1);
        tx.gas_limit = U256::from(TRANSFER_GAS - 1);
        tx.sign(&kp).unwrap();
        assert!(matches!(tx.verify_integrity(100), Err(TxError::InvalidGasLimit)));

        tx.gas_limit = U256::from(TRANSFER_GAS);
        tx.gas_price = U256::from(MIN_GAS_PRICE - 1);
        tx.sign(&kp).unwrap();
        assert!(matches!(tx.verify_integrity(100), Err(TxError::GasPriceTooLow)));
    }

    #[test]
    fn oversized_payload_is_refused_at_construction() {
        let kp = Keypair::generate();
        let res = Transaction::new(
            100,
            kp.address(),
            kp.address(),
            U256::zero(),
            1,
            PayloadType::Binary,
            vec![0u8; MAX_TX_PAYLOAD_BYTES + 1],
            U256::from(MIN_GAS_PRICE),
            U256::from(MAX_GAS_LIMIT),
        );
        assert!(matches!(res, Err(TxError::PayloadTooLarge(_))));
    }

    #[test]
    fn bincode_encoding_preserves_the_hash() {
        let kp = Keypair::generate();
        let tx = transfer(&kp, 7);
        let back = Transaction::decode(&tx.encode().unwrap()).unwrap();
        assert_eq!(back, tx);
        back.verify_integrity(100).unwrap();
    }

    #[test]
    fn heartbeat_payload_decodes() {
        let p = ProtocolPayload::Heartbeat { serial: 9 };
        assert_eq!(ProtocolPayload::decode(&p.encode().unwrap()).unwrap(), p);
    }
}
