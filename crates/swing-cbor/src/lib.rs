//! Canonical CBOR helpers and SHA-256 hashing used for snapshot, transcript and crank hashes.

use serde::Serialize;
use serde_cbor::{ser::Write as CborWrite, value::Value as CborValue};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix for serialized hashes (e.g. `sha256:deadbeef`).
pub const HASH_PREFIX: &str = "sha256:";

/// Serialize a value into canonical CBOR bytes using RFC 8949 deterministic rules.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut buf = Vec::with_capacity(256);
    write_canonical_cbor(value, &mut buf)?;
    Ok(buf)
}

/// Serialize a value directly into an arbitrary CBOR writer using canonical settings.
pub fn write_canonical_cbor<T: Serialize, W>(value: &T, writer: W) -> Result<(), serde_cbor::Error>
where
    W: CborWrite,
{
    // Round-tripping through `Value` sorts map keys.
    let canonical_value: CborValue = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(writer);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)
}

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero digest, used as the seed of hash chains.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Compute the hash of a value's canonical CBOR encoding.
    pub fn of_cbor<T: Serialize>(value: &T) -> Result<Self, serde_cbor::Error> {
        Ok(Self::of_bytes(&to_canonical_cbor(value)?))
    }

    /// Compute the hash of the provided byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_digest(hasher)
    }

    /// Extend a hash chain: `sha256(prev || next)`.
    pub fn chain(prev: &Hash, next: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(prev.0);
        hasher.update(next);
        Self::from_digest(hasher)
    }

    fn from_digest(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&digest);
        Hash(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render the digest as a `sha256:...` hex string.
    pub fn to_hex(&self) -> String {
        format!("{HASH_PREFIX}{}", hex::encode(self.0))
    }

    /// Parse a hash from its `sha256:`-prefixed hex string representation.
    pub fn from_hex_str(s: &str) -> Result<Self, HashParseError> {
        let rest = s.strip_prefix(HASH_PREFIX).ok_or(HashParseError::MissingPrefix)?;
        if rest.len() != 64 {
            return Err(HashParseError::InvalidLength(rest.len()));
        }
        let mut buf = [0u8; 32];
        hex::decode_to_slice(rest, &mut buf).map_err(HashParseError::InvalidHex)?;
        Ok(Hash(buf))
    }

    /// Attempt to build a hash from raw bytes, ensuring the length matches.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HashLengthError> {
        if bytes.len() != 32 {
            return Err(HashLengthError(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Hash(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl TryFrom<&str> for Hash {
    type Error = HashParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Hash::from_hex_str(value)
    }
}

/// Incremental hasher fed with a stream of records.
///
/// Cloning captures the running state, so a caller can checkpoint and later
/// restore it.
#[derive(Clone, Default)]
pub struct HashWriter {
    inner: Sha256,
    records: u64,
}

impl HashWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record. Records are length-prefixed so `("ab","c")` and `("a","bc")` differ.
    pub fn record(&mut self, bytes: &[u8]) {
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self.records += 1;
    }

    /// Number of records fed since creation or the last `finish_reset`.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Produce the digest and reset to an empty state.
    pub fn finish_reset(&mut self) -> Hash {
        let done = std::mem::take(self);
        Hash::from_digest(done.inner)
    }
}

impl fmt::Debug for HashWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashWriter")
            .field("records", &self.records)
            .finish()
    }
}

/// Error returned when a `sha256:` string is malformed.
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    #[error("hash string missing '{HASH_PREFIX}' prefix")]
    MissingPrefix,
    #[error("hash hex length must be 64, got {0}")]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Error returned when attempting to create a hash from the wrong byte length.
#[derive(Debug, thiserror::Error)]
#[error("hash must be 32 bytes, got {0}")]
pub struct HashLengthError(pub usize);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn canonical_encoding_ignores_map_insertion_order() {
        let mut a = HashMap::new();
        a.insert("zeta", 1u32);
        a.insert("alpha", 2u32);
        a.insert("mid", 3u32);
        let mut b = HashMap::new();
        b.insert("mid", 3u32);
        b.insert("alpha", 2u32);
        b.insert("zeta", 1u32);
        assert_eq!(
            to_canonical_cbor(&a).unwrap(),
            to_canonical_cbor(&b).unwrap()
        );
        assert_eq!(Hash::of_cbor(&a).unwrap(), Hash::of_cbor(&b).unwrap());
    }

    #[test]
    fn canonical_bytes_decode_to_same_value() {
        let value = json!({"vat": "v1", "slots": ["ko1", "kp2"], "n": 7});
        let bytes = to_canonical_cbor(&value).unwrap();
        let decoded: serde_json::Value = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn parse_and_format_round_trip() {
        let original = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let hash = Hash::from_hex_str(original).expect("parse");
        assert_eq!(hash.to_hex(), original);
        assert!(Hash::from_hex_str("0123").is_err());
        assert!(Hash::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn chain_depends_on_order() {
        let one = Hash::chain(&Hash::chain(&Hash::ZERO, b"a"), b"b");
        let two = Hash::chain(&Hash::chain(&Hash::ZERO, b"b"), b"a");
        assert_ne!(one, two);
        assert_eq!(one, Hash::chain(&Hash::chain(&Hash::ZERO, b"a"), b"b"));
    }

    #[test]
    fn hash_writer_checkpoint_restores_state() {
        let mut writer = HashWriter::new();
        writer.record(b"add k1 v1");
        let checkpoint = writer.clone();
        writer.record(b"delete k2");
        assert_eq!(writer.records(), 2);

        let mut restored = checkpoint.clone();
        let mut expected = checkpoint;
        assert_eq!(restored.finish_reset(), expected.finish_reset());
        assert_eq!(restored.records(), 0);
    }

    #[test]
    fn hash_writer_records_are_framed() {
        let mut left = HashWriter::new();
        left.record(b"ab");
        left.record(b"c");
        let mut right = HashWriter::new();
        right.record(b"a");
        right.record(b"bc");
        assert_ne!(left.finish_reset(), right.finish_reset());
    }
}
