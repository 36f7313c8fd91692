//! Big-endian fixed-width integer codecs.
//!
//! Everything that hits the wire or a storage key is big-endian, so keys
//! built from heights sort numerically in sled and frames read the same on
//! every host. Decoders take a slice that must be at least as long as the
//! integer; extra trailing bytes are ignored.

/// Returned when a decoder is handed fewer bytes than it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("need {needed} bytes, got {got}")]
pub struct ShortBuffer {
    pub needed: usize,
    pub got: usize,
}

macro_rules! be_codec {
    ($encode:ident, $decode:ident, $ty:ty) => {
        pub fn $encode(v: $ty) -> [u8; std::mem::size_of::<$ty>()] {
            v.to_be_bytes()
        }

        pub fn $decode(buf: &[u8]) -> Result<$ty, ShortBuffer> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes: [u8; N] = buf
                .get(..N)
                .and_then(|s| s.try_into().ok())
                .ok_or(ShortBuffer {
                    needed: N,
                    got: buf.len(),
                })?;
            Ok(<$ty>::from_be_bytes(bytes))
        }
    };
}

be_codec!(encode_u16, decode_u16, u16);
be_codec!(encode_u32, decode_u32, u32);
be_codec!(encode_u64, decode_u64, u64);
be_codec!(encode_i16, decode_i16, i16);
be_codec!(encode_i32, decode_i32, i32);
be_codec!(encode_i64, decode_i64, i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_big_endian() {
        assert_eq!(encode_u32(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(encode_u16(0xABCD), [0xAB, 0xCD]);
        assert_eq!(encode_i16(-1), [0xFF, 0xFF]);
        assert_eq!(decode_u64(&[0, 0, 0, 0, 0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn signed_values_survive() {
        assert_eq!(decode_i64(&encode_i64(i64::MIN)).unwrap(), i64::MIN);
        assert_eq!(decode_i32(&encode_i32(-42)).unwrap(), -42);
    }

    #[test]
    fn encoded_heights_sort_numerically() {
        let mut keys: Vec<[u8; 8]> = [300u64, 2, 70_000, 1].iter().map(|h| encode_u64(*h)).collect();
        keys.sort();
        let decoded: Vec<u64> = keys.iter().map(|k| decode_u64(k).unwrap()).collect();
        assert_eq!(decoded, vec![1, 2, 300, 70_000]);
    }

    #[test]
    fn short_buffer_is_reported() {
        assert_eq!(decode_u32(&[1, 2]), Err(ShortBuffer { needed: 4, got: 2 }));
        // Trailing bytes are fine.
        assert_eq!(decode_u16(&[0, 5, 9, 9]).unwrap(), 5);
    }
}
