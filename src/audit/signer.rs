//! Ledger Signing
//!
//! HMAC-SHA256 over chain hashes and checkpoints. The key is provisioned by
//! the operator so signatures stay verifiable across restarts.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::path::Path;
use subtle::ConstantTimeEq;

use crate::audit::digest::HashDigest;
use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

/// Shortest key accepted, in bytes.
pub const MIN_KEY_LEN: usize = 32;

/// Operator-provisioned HMAC key.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn from_bytes(bytes: Vec<u8>) -> LedgerResult<Self> {
        if bytes.len() < MIN_KEY_LEN {
            return Err(LedgerError::CryptoError(format!(
                "Signing key must be at least {} bytes, got {}",
                MIN_KEY_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(value: &str) -> LedgerResult<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| LedgerError::CryptoError(format!("Invalid signing key hex: {}", e)))?;
        Self::from_bytes(bytes)
    }

    /// Read a hex-encoded key from a file.
    pub fn from_file(path: &Path) -> LedgerResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            LedgerError::ConfigError(format!("Failed to read signing key {:?}: {}", path, e))
        })?;
        Self::from_hex(&contents)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey(<{} bytes redacted>)", self.0.len())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSigner {
    key: SigningKey,
}

impl LedgerSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Hex-encoded HMAC of arbitrary bytes.
    pub fn sign(&self, message: &[u8]) -> LedgerResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key.0)
            .map_err(|e| LedgerError::CryptoError(format!("Invalid signing key: {}", e)))?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signature over a chain hash, computed on its hex form.
    pub fn sign_digest(&self, digest: &HashDigest) -> LedgerResult<String> {
        self.sign(digest.to_hex().as_bytes())
    }

    /// Constant-time check of a stored hex signature. Malformed hex is a mismatch.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(computed) = self.sign(message) else {
            return false;
        };
        let Ok(actual) = hex::decode(computed) else {
            return false;
        };
        if expected.len() != actual.len() {
            return false;
        }
        expected.ct_eq(actual.as_slice()).into()
    }

    pub fn verify_digest(&self, digest: &HashDigest, signature: &str) -> bool {
        self.verify(digest.to_hex().as_bytes(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> LedgerSigner {
        LedgerSigner::new(SigningKey::from_bytes(vec![7u8; 32]).unwrap())
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(SigningKey::from_bytes(vec![1u8; 16]).is_err());
        assert!(SigningKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_sign_is_deterministic() {
        let digest = HashDigest::of(b"row");
        let signer = signer();
        let a = signer.sign_digest(&digest).unwrap();
        let b = signer.sign_digest(&digest).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let digest = HashDigest::of(b"row");
        let signer = signer();
        let signature = signer.sign_digest(&digest).unwrap();

        assert!(signer.verify_digest(&digest, &signature));
        assert!(!signer.verify_digest(&HashDigest::of(b"other"), &signature));
        assert!(!signer.verify_digest(&digest, "zz"));
        assert!(!signer.verify_digest(&digest, &signature[..10]));
    }

    #[test]
    fn test_different_keys_disagree() {
        let digest = HashDigest::of(b"row");
        let other = LedgerSigner::new(SigningKey::from_bytes(vec![8u8; 32]).unwrap());
        let signature = signer().sign_digest(&digest).unwrap();
        assert!(!other.verify_digest(&digest, &signature));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = SigningKey::from_bytes(vec![9u8; 32]).unwrap();
        assert_eq!(format!("{:?}", key), "SigningKey(<32 bytes redacted>)");
    }
}
