//! Ed25519 signing keys held by the development crypto box

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a raw Ed25519 seed or public key
pub const ED25519_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature
pub const ED25519_SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature format")]
    InvalidSignatureFormat,

    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}

/// Ed25519 key pair
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a raw 32-byte seed
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let seed: [u8; ED25519_KEY_LEN] =
            seed.try_into().map_err(|_| KeyError::InvalidKeyLength {
                expected: ED25519_KEY_LEN,
                actual: seed.len(),
            })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key(&self) -> [u8; ED25519_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn seed(&self) -> [u8; ED25519_KEY_LEN] {
        self.signing_key.to_bytes()
    }

    /// Stable identifier derived from the public key
    pub fn key_id(&self) -> String {
        key_id(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Identifier of a public key: first 16 bytes of its SHA-256, hex
pub fn key_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..16])
}

/// Verify a detached signature against a raw public key
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), KeyError> {
    let public_key: [u8; ED25519_KEY_LEN] =
        public_key.try_into().map_err(|_| KeyError::InvalidKeyLength {
            expected: ED25519_KEY_LEN,
            actual: public_key.len(),
        })?;
    let verifying_key =
        VerifyingKey::from_bytes(&public_key).map_err(|_| KeyError::InvalidPublicKey)?;

    let signature: [u8; ED25519_SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| KeyError::InvalidSignatureFormat)?;

    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| KeyError::SignatureVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let pair = SigningKeyPair::generate();
        let sig = pair.sign(b"hello");
        assert!(verify_signature(&pair.public_key(), b"hello", &sig).is_ok());
        assert!(verify_signature(&pair.public_key(), b"hellp", &sig).is_err());
    }

    #[test]
    fn test_from_seed_roundtrip() {
        let pair = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_seed(&pair.seed()).unwrap();
        assert_eq!(pair.public_key(), restored.public_key());
        assert_eq!(pair.key_id(), restored.key_id());
    }

    #[test]
    fn test_bad_seed_length() {
        let err = SigningKeyPair::from_seed(&[1u8; 31]).err().unwrap();
        assert!(matches!(
            err,
            KeyError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[test]
    fn test_key_id_length() {
        assert_eq!(key_id(&[0u8; 32]).len(), 32);
    }
}
