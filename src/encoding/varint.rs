//! # Variable-Length Integer Encoding
//!
//! Length fields inside bucket entries and composite-key parts are encoded
//! as LEB128 varints through the `integer_encoding` crate: seven value bits
//! per byte, continuation bit set on every byte except the last.
//!
//! | Value range        | Width |
//! |--------------------|-------|
//! | 0 - 127            | 1     |
//! | 128 - 16383        | 2     |
//! | 16384 - 2097151    | 3     |
//! | ...                | ...   |
//! | up to `u64::MAX`   | 10    |
//!
//! Lengths under 128 bytes (the overwhelming majority of fields in 16KB
//! bucket regions) cost a single byte, and nothing region-sized ever needs
//! more than three.
//!
//! This module pins the crate behind the narrow slice-based shape the bucket
//! layout wants: explicit byte counts in and out, and `eyre` errors instead
//! of an `Option` on truncated or malformed input.

use eyre::{bail, Result};
use integer_encoding::VarInt;

/// Widest possible encoding of a `u64` (ten 7-bit groups).
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `encode_varint` will write for `value`.
pub fn varint_len(value: u64) -> usize {
    value.required_space()
}

/// Encodes `value` at the start of `buf`, returning the number of bytes
/// written. `buf` must hold at least `varint_len(value)` bytes.
pub fn encode_varint(value: u64, buf: &mut [u8]) -> usize {
    value.encode_var(buf)
}

/// Decodes a varint from the start of `buf`, returning `(value, bytes_read)`.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    match u64::decode_var(buf) {
        Some(decoded) => Ok(decoded),
        None => bail!("truncated or malformed varint"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_at_group_boundaries() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for value in [0, 1, 127, 128, 16383, 16384, 2_097_151, 2_097_152, u64::MAX] {
            let written = encode_varint(value, &mut buf);
            assert_eq!(written, varint_len(value), "width mismatch for {}", value);

            let (decoded, read) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(read, written);
        }
    }

    #[test]
    fn width_grows_by_one_per_seven_bits() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16383), 2);
        assert_eq!(varint_len(16384), 3);
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_LEN);
    }

    #[test]
    fn continuation_bit_marks_every_byte_but_the_last() {
        let mut buf = [0u8; MAX_VARINT_LEN];

        let written = encode_varint(128, &mut buf);
        assert_eq!(&buf[..written], &[0x80, 0x01]);

        let written = encode_varint(300, &mut buf);
        assert_eq!(&buf[..written], &[0xAC, 0x02]);
    }

    #[test]
    fn decode_rejects_empty_buffer() {
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn decode_rejects_dangling_continuation() {
        // Every byte claims a successor that never arrives.
        assert!(decode_varint(&[0x80]).is_err());
        assert!(decode_varint(&[0xFF, 0xFF]).is_err());
    }

    #[test]
    fn decode_reads_only_one_value() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let written = encode_varint(5000, &mut buf);
        buf[written] = 0x7F; // unrelated trailing byte

        let (decoded, read) = decode_varint(&buf).unwrap();
        assert_eq!(decoded, 5000);
        assert_eq!(read, written);
    }
}
