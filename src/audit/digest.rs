//! Hash Digests
//!
//! Fixed-size SHA-256 values used for content hashes, chain hashes and
//! checkpoints. Serialized as lowercase hex.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::LedgerError;

/// Version of the canonical field layout fed into the content hash.
/// Any change to field order or encoding must bump this.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// `previousHash` of the first row in the ledger.
pub const GENESIS_HASH: HashDigest = HashDigest([0u8; 32]);

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashDigest([u8; 32]);

impl HashDigest {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First `len` hex characters, for log lines and CEF fields.
    pub fn short(&self, len: usize) -> String {
        let mut hex = self.to_hex();
        hex.truncate(len);
        hex
    }

    pub fn from_hex(value: &str) -> Result<Self, LedgerError> {
        let bytes = hex::decode(value)
            .map_err(|e| LedgerError::SerializationError(format!("Invalid digest hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            LedgerError::SerializationError(format!(
                "Digest must be 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({})", self.short(16))
    }
}

impl FromStr for HashDigest {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for HashDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(serde::de::Error::custom)
    }
}
