//! Transaction construction via the builder pattern.
//!
//! The [`TransactionBuilder`] starts from a transfer with the minimum gas
//! price and just enough gas for the payload, so the common case is
//! `TransactionBuilder::new(chain_id, from, to).value(v).nonce(n).build()`.
//! `build_signed` signs in the same step.

use primitive_types::U256;

use super::types::{PayloadType, Transaction, TxResult};
use crate::config::MIN_GAS_PRICE;
use crate::crypto::{Address, Keypair};

#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    chain_id: u32,
    from: Address,
    to: Address,
    value: U256,
    nonce: u64,
    timestamp: Option<i64>,
    payload_type: PayloadType,
    payload: Vec<u8>,
    gas_price: U256,
    gas_limit: Option<U256>,
}

impl TransactionBuilder {
    pub fn new(chain_id: u32, from: Address, to: Address) -> Self {
        Self {
            chain_id,
            from,
            to,
            value: U256::zero(),
            nonce: 0,
            timestamp: None,
            payload_type: PayloadType::Binary,
            payload: Vec::new(),
            gas_price: U256::from(MIN_GAS_PRICE),
            gas_limit: None,
        }
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Pin the timestamp (seconds). Defaults to now.
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn payload(mut self, payload_type: PayloadType, payload: Vec<u8>) -> Self {
        self.payload_type = payload_type;
        self.payload = payload;
        self
    }

    pub fn gas_price(mut self, gas_price: U256) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn gas_limit(mut self, gas_limit: U256) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    /// An unsigned transaction with its hash computed.
    pub fn build(self) -> TxResult<Transaction> {
        let mut tx = Transaction::new(
            self.chain_id,
            self.from,
            self.to,
            self.value,
            self.nonce,
            self.payload_type,
            self.payload,
            self.gas_price,
            U256::zero(),
        )?;
        tx.gas_limit = self
            .gas_limit
            .unwrap_or_else(|| U256::from(tx.intrinsic_gas()));
        if let Some(ts) = self.timestamp {
            tx.timestamp = ts;
        }
        tx.hash = tx.calculate_hash();
        Ok(tx)
    }

    pub fn build_signed(self, keypair: &Keypair) -> TxResult<Transaction> {
        let mut tx = self.build()?;
        tx.sign(keypair)?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TRANSFER_GAS;

    #[test]
    fn defaults_cover_a_plain_transfer() {
        let kp = Keypair::generate();
        let tx = TransactionBuilder::new(1, kp.address(), Address::null())
            .value(U256::from(5u64))
            .nonce(3)
            .build_signed(&kp)
            .unwrap();
        assert_eq!(tx.gas_limit, U256::from(TRANSFER_GAS));
        assert_eq!(tx.gas_price, U256::from(MIN_GAS_PRICE));
        tx.verify_integrity(1).unwrap();
    }

    #[test]
    fn payload_raises_the_default_gas_limit() {
        let kp = Keypair::generate();
        let tx = TransactionBuilder::new(1, kp.address(), kp.address())
            .payload(PayloadType::Binary, vec![7u8; 100])
            .build()
            .unwrap();
        assert_eq!(tx.gas_limit, U256::from(TRANSFER_GAS + 100));
    }

    #[test]
    fn pinned_timestamp_gives_a_stable_hash() {
        let kp = Keypair::generate();
        let make = || {
            TransactionBuilder::new(1, kp.address(), Address::null())
                .nonce(1)
                .timestamp(1_700_000_000)
                .build()
                .unwrap()
        };
        assert_eq!(make().hash, make().hash);
    }
}
