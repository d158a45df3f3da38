//! # Key and Value Codecs
//!
//! Buckets store keys and values as opaque byte strings; a codec turns typed
//! values into those bytes and back. Each codec carries a stable one-byte id
//! that the tree stamps into its root bucket on creation, so a later load can
//! verify it is being given the codecs the tree was built with.
//!
//! Entry slots record byte lengths separately, so codecs never need to be
//! self-delimiting: `deserialize` always receives exactly the bytes that
//! `serialize` produced.

use eyre::{bail, ensure, Result};

use super::key::{CompositeKey, KeyPart};
use crate::encoding::varint::{decode_varint, encode_varint, varint_len, MAX_VARINT_LEN};

/// Byte codec for one key or value type.
pub trait BinarySerializer {
    type Item;

    /// Stable codec identifier stored in root buckets.
    const ID: u8;

    fn serialize(&self, item: &Self::Item, buf: &mut Vec<u8>) -> Result<()>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Item>;
}

/// Big-endian `i64` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int64Serializer;

impl BinarySerializer for Int64Serializer {
    type Item = i64;

    const ID: u8 = 1;

    fn serialize(&self, item: &i64, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&item.to_be_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<i64> {
        ensure!(bytes.len() == 8, "expected 8 bytes for i64, got {}", bytes.len());
        Ok(i64::from_be_bytes(bytes.try_into()?))
    }
}

/// UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Serializer;

impl BinarySerializer for Utf8Serializer {
    type Item = String;

    const ID: u8 = 2;

    fn serialize(&self, item: &String, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
}

const PART_TAG_INT: u8 = 0;
const PART_TAG_TEXT: u8 = 1;

/// Codec for [`CompositeKey`]: a varint part count followed by tagged parts.
///
/// Sentinel-bounded keys are search-time artifacts and refuse to serialize.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositeKeySerializer;

impl BinarySerializer for CompositeKeySerializer {
    type Item = CompositeKey;

    const ID: u8 = 3;

    fn serialize(&self, item: &CompositeKey, buf: &mut Vec<u8>) -> Result<()> {
        ensure!(
            item.bound().is_none(),
            "sentinel-bounded keys cannot be stored"
        );

        let mut scratch = [0u8; MAX_VARINT_LEN];
        let n = encode_varint(item.parts().len() as u64, &mut scratch);
        buf.extend_from_slice(&scratch[..n]);

        for part in item.parts() {
            match part {
                KeyPart::Int(v) => {
                    buf.push(PART_TAG_INT);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                KeyPart::Text(s) => {
                    buf.push(PART_TAG_TEXT);
                    let n = encode_varint(s.len() as u64, &mut scratch);
                    buf.extend_from_slice(&scratch[..n]);
                    buf.extend_from_slice(s.as_bytes());
                }
            }
        }
        Ok(())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CompositeKey> {
        let (count, mut pos) = decode_varint(bytes)?;

        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ensure!(pos < bytes.len(), "truncated composite key part");
            let tag = bytes[pos];
            pos += 1;

            match tag {
                PART_TAG_INT => {
                    ensure!(pos + 8 <= bytes.len(), "truncated integer key part");
                    parts.push(KeyPart::Int(i64::from_be_bytes(
                        bytes[pos..pos + 8].try_into()?,
                    )));
                    pos += 8;
                }
                PART_TAG_TEXT => {
                    let (len, n) = decode_varint(&bytes[pos..])?;
                    pos += n;
                    let len = len as usize;
                    ensure!(pos + len <= bytes.len(), "truncated text key part");
                    parts.push(KeyPart::Text(
                        std::str::from_utf8(&bytes[pos..pos + len])?.to_string(),
                    ));
                    pos += len;
                }
                other => bail!("invalid composite key part tag: {}", other),
            }
        }

        ensure!(
            pos == bytes.len(),
            "trailing bytes after composite key: {} of {}",
            pos,
            bytes.len()
        );

        Ok(CompositeKey::new(parts))
    }
}

/// Serialized length of `item` under `codec`, used for space checks before
/// the bytes are actually produced.
pub fn serialized_len<S: BinarySerializer>(codec: &S, item: &S::Item) -> Result<usize> {
    let mut buf = Vec::new();
    codec.serialize(item, &mut buf)?;
    Ok(buf.len())
}

/// Length a varint-prefixed field occupies inside an entry.
pub fn field_len(payload_len: usize) -> usize {
    varint_len(payload_len as u64) + payload_len
}
