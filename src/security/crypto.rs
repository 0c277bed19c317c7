//! Cryptographic utilities.
//!
//! Provides Ed25519 signing/verification and SHA3-256 hashing.

use crate::core::{Error, Hash256, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use sha3::{Digest, Sha3_256};

/// Ed25519 key pair.
#[derive(Clone)]
pub struct CryptoSuite {
    signing_key: SigningKey,
}

impl CryptoSuite {
    /// Create a new CryptoSuite with a random key pair.
    pub fn new() -> Self {
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        Self {
            signing_key: SigningKey::from_bytes(&secret_key_bytes),
        }
    }

    /// Create from existing signing key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the signing key bytes.
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the verifying (public) key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the verifying key bytes.
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Verify a signature made by this key pair.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify(&self.verifying_key(), message, signature)
    }
}

impl Default for CryptoSuite {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CryptoSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSuite")
            .field("verifying_key", &hex::encode(self.verifying_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a signature with a public key.
pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> Result<()> {
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::auth(format!("invalid signature length {}", signature.len())))?;
    let sig = Signature::from_bytes(&sig_bytes);
    public_key.verify_strict(message, &sig)?;
    Ok(())
}

/// Parse raw public key bytes.
pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::auth(format!("invalid public key length {}", bytes.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::auth(format!("invalid public key: {}", e)))
}

/// 32 random bytes for handshake nonces.
pub fn random_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Compute SHA3-256 hash of data.
pub fn sha3_256(data: &[u8]) -> Hash256 {
    sha3_256_multi(&[data])
}

/// Compute SHA3-256 hash of multiple data chunks.
pub fn sha3_256_multi(chunks: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha3_256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hasher.finalize());
    Hash256::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let suite = CryptoSuite::new();
        let signature = suite.sign(b"signed region");
        assert!(suite.verify(b"signed region", &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message() {
        let suite = CryptoSuite::new();
        let signature = suite.sign(b"signed region");
        let err = suite.verify(b"signed regioN", &signature).unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_verify_bad_length() {
        let suite = CryptoSuite::new();
        assert!(suite.verify(b"x", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_from_bytes_is_stable() {
        let suite = CryptoSuite::new();
        let again = CryptoSuite::from_bytes(&suite.signing_key_bytes());
        assert_eq!(suite.verifying_key_bytes(), again.verifying_key_bytes());
    }

    #[test]
    fn test_sha3_256_multi_matches_concatenation() {
        let chunks: &[&[u8]] = &[b"chunk1", b"chunk2"];
        assert_eq!(sha3_256_multi(chunks), sha3_256(b"chunk1chunk2"));
        assert_ne!(sha3_256(b"data1"), sha3_256(b"data2"));
    }

    #[test]
    fn test_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
