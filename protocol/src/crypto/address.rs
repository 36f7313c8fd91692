//! Account addresses.
//!
//! An address is a one-byte type tag plus the first 20 bytes of the BLAKE3
//! digest of a public key (normal accounts) or of `sender ‖ nonce`
//! (contracts). The printable form is base58 over
//! `PADDING ‖ type ‖ body ‖ checksum[4]`, where the checksum is the head of
//! BLAKE3 over everything before it. The fixed padding byte makes every
//! normal address start with the same character.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::hash::blake3_hash;

const ADDRESS_PADDING: u8 = 0x19;
const ADDRESS_BODY_LENGTH: usize = 20;
const ADDRESS_CHECKSUM_LENGTH: usize = 4;
const ADDRESS_ENCODED_LENGTH: usize = 2 + ADDRESS_BODY_LENGTH + ADDRESS_CHECKSUM_LENGTH;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 encoding")]
    Encoding,
    #[error("invalid address length {0}")]
    Length(usize),
    #[error("invalid address padding")]
    Padding,
    #[error("unknown address type {0:#04x}")]
    Type(u8),
    #[error("address checksum mismatch")]
    Checksum,
}

/// Normal accounts and contract accounts share a key space but never
/// collide because the type tag is part of the address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressType {
    Normal = 0x57,
    Contract = 0x58,
}

impl TryFrom<u8> for AddressType {
    type Error = AddressError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x57 => Ok(Self::Normal),
            0x58 => Ok(Self::Contract),
            other => Err(AddressError::Type(other)),
        }
    }
}

/// A principal on the chain. Equality is byte equality; ordering is byte
/// ordering, which is what dynasty member sorting relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    kind: AddressType,
    body: [u8; ADDRESS_BODY_LENGTH],
}

impl Address {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self::with_body(AddressType::Normal, public_key)
    }

    /// The all-zero normal address. Genesis uses it as coinbase and
    /// proposer.
    pub fn null() -> Self {
        Self {
            kind: AddressType::Normal,
            body: [0u8; ADDRESS_BODY_LENGTH],
        }
    }

    pub fn contract(sender: &Address, nonce: u64) -> Self {
        let mut seed = sender.to_bytes();
        seed.extend_from_slice(&nonce.to_be_bytes());
        Self::with_body(AddressType::Contract, &seed)
    }

    fn with_body(kind: AddressType, material: &[u8]) -> Self {
        let digest = blake3_hash(material);
        let mut body = [0u8; ADDRESS_BODY_LENGTH];
        body.copy_from_slice(&digest.as_bytes()[..ADDRESS_BODY_LENGTH]);
        Self { kind, body }
    }

    pub fn kind(&self) -> AddressType {
        self.kind
    }

    /// Raw bytes: type tag followed by the 20-byte body. Used as the
    /// account key in the state trie.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + ADDRESS_BODY_LENGTH);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.body);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != 1 + ADDRESS_BODY_LENGTH {
            return Err(AddressError::Length(bytes.len()));
        }
        let kind = AddressType::try_from(bytes[0])?;
        let mut body = [0u8; ADDRESS_BODY_LENGTH];
        body.copy_from_slice(&bytes[1..]);
        Ok(Self { kind, body })
    }

    pub fn to_base58(&self) -> String {
        let mut raw = Vec::with_capacity(ADDRESS_ENCODED_LENGTH);
        raw.push(ADDRESS_PADDING);
        raw.extend_from_slice(&self.to_bytes());
        let checksum = blake3_hash(&raw);
        raw.extend_from_slice(&checksum.as_bytes()[..ADDRESS_CHECKSUM_LENGTH]);
        bs58::encode(raw).into_string()
    }

    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let raw = bs58::decode(s).into_vec().map_err(|_| AddressError::Encoding)?;
        if raw.len() != ADDRESS_ENCODED_LENGTH {
            return Err(AddressError::Length(raw.len()));
        }
        if raw[0] != ADDRESS_PADDING {
            return Err(AddressError::Padding);
        }
        let (content, checksum) = raw.split_at(ADDRESS_ENCODED_LENGTH - ADDRESS_CHECKSUM_LENGTH);
        if &blake3_hash(content).as_bytes()[..ADDRESS_CHECKSUM_LENGTH] != checksum {
            return Err(AddressError::Checksum);
        }
        Self::from_bytes(&content[1..])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_base58())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base58())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Address::parse(&s).map_err(D::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Address::from_bytes(&bytes).map_err(D::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_roundtrip_and_checksum() {
        let addr = Address::from_public_key(&[3u8; 32]);
        let s = addr.to_base58();
        assert_eq!(Address::parse(&s).unwrap(), addr);

        // Flip one character in the middle; the checksum must catch it.
        let mut chars: Vec<char> = s.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == 'a' { 'b' } else { 'a' };
        let tampered: String = chars.into_iter().collect();
        assert!(Address::parse(&tampered).is_err());
    }

    #[test]
    fn normal_addresses_share_a_prefix() {
        let a = Address::from_public_key(&[1u8; 32]).to_base58();
        let b = Address::from_public_key(&[2u8; 32]).to_base58();
        assert_eq!(a.chars().next(), b.chars().next());
    }

    #[test]
    fn contract_address_differs_from_sender() {
        let sender = Address::from_public_key(&[9u8; 32]);
        let c = Address::contract(&sender, 1);
        assert_eq!(c.kind(), AddressType::Contract);
        assert_ne!(c, Address::contract(&sender, 2));
    }

    #[test]
    fn bytes_roundtrip() {
        let addr = Address::from_public_key(&[5u8; 32]);
        assert_eq!(Address::from_bytes(&addr.to_bytes()).unwrap(), addr);
        assert_eq!(Address::from_bytes(&[0u8; 3]), Err(AddressError::Length(3)));
    }

    #[test]
    fn json_uses_the_printable_form() {
        let addr = Address::from_public_key(&[4u8; 32]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.to_base58()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
