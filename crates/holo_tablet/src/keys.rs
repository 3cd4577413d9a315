//! Row key encoding and the partition hash code.
//!
//! A row key is laid out as:
//!
//! ```text
//! [hash_code: u16 BE][hash values...][range values...]
//! ```
//!
//! Each value is tagged and encoded so that byte order matches value order
//! and no encoded value is a prefix of another. That lets a tablet range-scan
//! one hash partition in range-key order and narrow the scan with range-key
//! bounds directly on the encoded bytes.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// 16-bit partition hash code derived from the hash-key values.
pub type HashCode = u16;

/// Size of the hash code space; partitions split `[0, HASH_SPACE)`.
pub const HASH_SPACE: u32 = 1 << 16;

const TAG_BOOL: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_BINARY: u8 = 0x06;

/// Half-open range of hash codes `[start, end)` owned by a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u32,
    pub end: u32,
}

impl HashRange {
    pub const FULL: HashRange = HashRange {
        start: 0,
        end: HASH_SPACE,
    };

    pub fn contains(&self, code: HashCode) -> bool {
        let code = u32::from(code);
        code >= self.start && code < self.end
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoded key bounds covering every row whose hash code is in range.
    pub fn key_bounds(&self) -> (Vec<u8>, Option<Vec<u8>>) {
        let start = (self.start as u16).to_be_bytes().to_vec();
        let end = if self.end >= HASH_SPACE {
            None
        } else {
            Some((self.end as u16).to_be_bytes().to_vec())
        };
        (start, end)
    }
}

/// Append the order-preserving encoding of a non-null key value.
pub fn encode_value(out: &mut Vec<u8>, value: &Value) -> anyhow::Result<()> {
    match value {
        Value::Null => anyhow::bail!("key values must not be null"),
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*v));
        }
        Value::Int32(v) => {
            out.push(TAG_INT32);
            out.extend_from_slice(&((*v as u32) ^ (1u32 << 31)).to_be_bytes());
        }
        Value::Int64(v) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes());
        }
        Value::Double(v) => {
            let bits = v.to_bits();
            let ordered = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits | (1u64 << 63)
            };
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        Value::String(v) => {
            out.push(TAG_STRING);
            encode_escaped(out, v.as_bytes());
        }
        Value::Binary(v) => {
            out.push(TAG_BINARY);
            encode_escaped(out, v);
        }
    }
    Ok(())
}

// 0x00 is escaped as 0x00 0xFF and the value ends with 0x00 0x00, which keeps
// ordering and makes the encoding self-delimiting.
fn encode_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &byte in bytes {
        if byte == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn encode_values(values: &[Value]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for value in values {
        encode_value(&mut out, value)?;
    }
    Ok(out)
}

/// Compute the partition hash code for an ordered list of hash-key values.
///
/// The code only depends on the values themselves, so it is stable across
/// restarts and builds.
pub fn hash_code(hash_values: &[Value]) -> anyhow::Result<HashCode> {
    let encoded = encode_values(hash_values)?;
    Ok(fold_hash(crc32fast::hash(&encoded)))
}

fn fold_hash(crc: u32) -> HashCode {
    ((crc >> 16) ^ (crc & 0xffff)) as HashCode
}

/// Encoded identity of a row plus the hash code it routes by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowKey {
    pub hash_code: HashCode,
    /// Hash code followed by the encoded hash values.
    pub partition_prefix: Vec<u8>,
    /// Full key: partition prefix followed by the encoded range values.
    pub key: Vec<u8>,
}

impl RowKey {
    /// Prefix shared by every row with these hash-key values.
    pub fn partition(hash_values: &[Value]) -> anyhow::Result<(HashCode, Vec<u8>)> {
        let encoded = encode_values(hash_values)?;
        let code = fold_hash(crc32fast::hash(&encoded));
        let mut prefix = Vec::with_capacity(2 + encoded.len());
        prefix.extend_from_slice(&code.to_be_bytes());
        prefix.extend_from_slice(&encoded);
        Ok((code, prefix))
    }

    pub fn new(hash_values: &[Value], range_values: &[Value]) -> anyhow::Result<Self> {
        let (hash_code, partition_prefix) = Self::partition(hash_values)?;
        let mut key = partition_prefix.clone();
        for value in range_values {
            encode_value(&mut key, value)?;
        }
        Ok(Self {
            hash_code,
            partition_prefix,
            key,
        })
    }
}

/// Read the hash code stored at the front of an encoded row key.
pub fn key_hash_code(key: &[u8]) -> anyhow::Result<HashCode> {
    anyhow::ensure!(key.len() >= 2, "row key too short");
    Ok(u16::from_be_bytes([key[0], key[1]]))
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (the prefix is all `0xFF`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
