//! Password-protected key containers (AES-256-GCM)
//!
//! Layout: salt (16) || nonce (12) || ciphertext. The cipher key is
//! SHA-256(salt || password).

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Wrong password or corrupted container")]
    DecryptionFailed,

    #[error("Container too short")]
    TooShort,
}

fn cipher_for(salt: &[u8], password: &str) -> Result<Aes256Gcm, ContainerError> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    Aes256Gcm::new_from_slice(&hasher.finalize()).map_err(|_| ContainerError::EncryptionFailed)
}

/// Encrypt `plaintext` under `password` with a fresh salt and nonce
pub fn seal_container(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher_for(&salt, password)?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ContainerError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a container produced by [`seal_container`]
pub fn open_container(password: &str, sealed: &[u8]) -> Result<Vec<u8>, ContainerError> {
    if sealed.len() < SALT_LEN + NONCE_LEN {
        return Err(ContainerError::TooShort);
    }
    let (salt, rest) = sealed.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    cipher_for(salt, password)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ContainerError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let sealed = seal_container("pw", b"seed bytes").unwrap();
        assert_eq!(open_container("pw", &sealed).unwrap(), b"seed bytes");
    }

    #[test]
    fn test_wrong_password() {
        let sealed = seal_container("pw", b"seed bytes").unwrap();
        assert!(matches!(
            open_container("other", &sealed),
            Err(ContainerError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            open_container("pw", &[0u8; 20]),
            Err(ContainerError::TooShort)
        ));
    }

    #[test]
    fn test_fresh_salt_each_time() {
        let a = seal_container("pw", b"x").unwrap();
        let b = seal_container("pw", b"x").unwrap();
        assert_ne!(a, b);
    }
}
