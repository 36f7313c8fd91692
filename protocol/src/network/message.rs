//! # Wire Framing
//!
//! Every message on a stream is a 36-byte header followed by the payload.
//! All integers are big-endian.
//!
//! ```text
//! off len field
//!  0   4  magic        "NEB1"
//!  4   4  chain id
//!  8   3  reserved     zeros
//! 11   1  version
//! 12  12  name         ASCII, NUL padded
//! 24   4  data length
//! 28   4  data crc32   IEEE, over the payload
//! 32   4  header crc32 IEEE, over bytes 0..32
//! 36   N  data
//! ```
//!
//! Any violation is a protocol error and the stream carrying it is closed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::{
    MAX_MESSAGE_DATA_LENGTH, MAX_MESSAGE_NAME_LENGTH, MESSAGE_HEADER_LENGTH, MESSAGE_MAGIC,
};
use crate::util::codec::{decode_u32, encode_u32};

const NAME_OFFSET: usize = 12;
const DATA_LENGTH_OFFSET: usize = 24;
const DATA_CHECKSUM_OFFSET: usize = 28;
const HEADER_CHECKSUM_OFFSET: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("need {need} bytes, have {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("invalid magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("chain id {got} does not match {expected}")]
    InvalidChainId { expected: u32, got: u32 },

    #[error("header checksum mismatch")]
    InvalidHeaderChecksum,

    #[error("data checksum mismatch")]
    InvalidDataChecksum,

    #[error("payload of {0} bytes exceeds the limit")]
    DataTooLarge(usize),

    #[error("message name of {0} bytes is too long")]
    NameTooLong(usize),

    #[error("message name is not ASCII")]
    InvalidName,

    #[error("payload codec: {0}")]
    Codec(String),
}

pub type MessageResult<T> = Result<T, MessageError>;

fn crc(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    decode_u32(&buf[at..at + 4]).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub chain_id: u32,
    pub version: u8,
    pub name: String,
    pub data_length: u32,
    pub data_checksum: u32,
    pub header_checksum: u32,
}

impl MessageHeader {
    /// Parse and check the first 36 bytes of `buf`.
    pub fn parse(buf: &[u8], chain_id: u32) -> MessageResult<Self> {
        if buf.len() < MESSAGE_HEADER_LENGTH {
            return Err(MessageError::InsufficientData {
                need: MESSAGE_HEADER_LENGTH,
                got: buf.len(),
            });
        }
        let magic = read_u32(buf, 0);
        if magic != MESSAGE_MAGIC {
            return Err(MessageError::InvalidMagic(magic));
        }
        let header_checksum = read_u32(buf, HEADER_CHECKSUM_OFFSET);
        if crc(&buf[..HEADER_CHECKSUM_OFFSET]) != header_checksum {
            return Err(MessageError::InvalidHeaderChecksum);
        }
        let got = read_u32(buf, 4);
        if got != chain_id {
            return Err(MessageError::InvalidChainId {
                expected: chain_id,
                got,
            });
        }
        let data_length = read_u32(buf, DATA_LENGTH_OFFSET);
        if data_length as usize > MAX_MESSAGE_DATA_LENGTH {
            return Err(MessageError::DataTooLarge(data_length as usize));
        }
        let raw_name = &buf[NAME_OFFSET..NAME_OFFSET + MAX_MESSAGE_NAME_LENGTH];
        let end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
        let name = std::str::from_utf8(&raw_name[..end])
            .ok()
            .filter(|s| s.is_ascii())
            .ok_or(MessageError::InvalidName)?
            .to_string();

        Ok(Self {
            chain_id: got,
            version: buf[11],
            name,
            data_length,
            data_checksum: read_u32(buf, DATA_CHECKSUM_OFFSET),
            header_checksum,
        })
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MessageHeader,
    data: Bytes,
}

impl Message {
    pub fn new(chain_id: u32, version: u8, name: &str, data: impl Into<Bytes>) -> MessageResult<Self> {
        if name.len() > MAX_MESSAGE_NAME_LENGTH {
            return Err(MessageError::NameTooLong(name.len()));
        }
        if !name.is_ascii() {
            return Err(MessageError::InvalidName);
        }
        let data = data.into();
        if data.len() > MAX_MESSAGE_DATA_LENGTH {
            return Err(MessageError::DataTooLarge(data.len()));
        }
        let mut header = MessageHeader {
            chain_id,
            version,
            name: name.to_string(),
            data_length: data.len() as u32,
            data_checksum: crc(&data),
            header_checksum: 0,
        };
        header.header_checksum = crc(&header_prefix(&header));
        Ok(Self { header, data })
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn chain_id(&self) -> u32 {
        self.header.chain_id
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn data_checksum(&self) -> u32 {
        self.header.data_checksum
    }

    /// Header and payload as one frame.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(MESSAGE_HEADER_LENGTH + self.data.len());
        out.put_slice(&header_prefix(&self.header));
        out.put_slice(&encode_u32(self.header.header_checksum));
        out.put_slice(&self.data);
        out.freeze()
    }

    /// Attach a payload read separately to an already parsed header.
    pub fn with_data(header: MessageHeader, data: Bytes) -> MessageResult<Self> {
        if data.len() != header.data_length as usize {
            return Err(MessageError::InsufficientData {
                need: header.data_length as usize,
                got: data.len(),
            });
        }
        if crc(&data) != header.data_checksum {
            return Err(MessageError::InvalidDataChecksum);
        }
        Ok(Self { header, data })
    }

    /// Parse a complete frame.
    pub fn decode(frame: &[u8], chain_id: u32) -> MessageResult<Self> {
        let header = MessageHeader::parse(frame, chain_id)?;
        let need = MESSAGE_HEADER_LENGTH + header.data_length as usize;
        if frame.len() < need {
            return Err(MessageError::InsufficientData {
                need,
                got: frame.len(),
            });
        }
        let data = Bytes::copy_from_slice(&frame[MESSAGE_HEADER_LENGTH..need]);
        Self::with_data(header, data)
    }
}

/// Bytes 0..32 of the header.
fn header_prefix(h: &MessageHeader) -> [u8; HEADER_CHECKSUM_OFFSET] {
    let mut out = [0u8; HEADER_CHECKSUM_OFFSET];
    out[0..4].copy_from_slice(&encode_u32(MESSAGE_MAGIC));
    out[4..8].copy_from_slice(&encode_u32(h.chain_id));
    out[11] = h.version;
    out[NAME_OFFSET..NAME_OFFSET + h.name.len()].copy_from_slice(h.name.as_bytes());
    out[DATA_LENGTH_OFFSET..DATA_CHECKSUM_OFFSET].copy_from_slice(&encode_u32(h.data_length));
    out[DATA_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET].copy_from_slice(&encode_u32(h.data_checksum));
    out
}
