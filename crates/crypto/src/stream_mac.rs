//! Chained HMAC-SHA256 stream authentication
//!
//! Each direction of a connection keeps one running MAC. Every frame's header
//! and payload are fed in, the digest is finalized and sent after the frame,
//! and the MAC is restarted with that digest as its first input. A frame
//! therefore authenticates everything sent before it on the same connection.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Size of the trailing digest
pub const DIGEST_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum MacError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Stream digest mismatch")]
    VerificationFailed,
}

/// Pre-shared symmetric key for an authenticated stream
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(Vec<u8>);

impl StreamKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, MacError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(MacError::InvalidKey("empty key".into()));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded key as given on the command line or in config
    pub fn from_hex(text: &str) -> Result<Self, MacError> {
        let bytes = hex::decode(text.trim()).map_err(|e| MacError::InvalidKey(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamKey({} bytes)", self.0.len())
    }
}

/// Running MAC for one direction of a stream
#[derive(Clone)]
pub struct ChainedMac {
    keyed: HmacSha256,
    running: HmacSha256,
}

impl ChainedMac {
    pub fn new(key: &StreamKey) -> Result<Self, MacError> {
        let keyed = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| MacError::InvalidKey(e.to_string()))?;
        Ok(Self {
            running: keyed.clone(),
            keyed,
        })
    }

    /// Feed frame bytes into the running MAC
    pub fn update(&mut self, data: &[u8]) {
        self.running.update(data);
    }

    /// Finalize the digest over everything fed since the last seal and chain
    /// the next frame onto it
    pub fn seal(&mut self) -> [u8; DIGEST_LEN] {
        let finished = std::mem::replace(&mut self.running, self.keyed.clone());
        let digest: [u8; DIGEST_LEN] = finished.finalize().into_bytes().into();
        self.running.update(&digest);
        digest
    }

    /// Seal and compare against the digest received from the peer
    pub fn verify(&mut self, received: &[u8]) -> Result<(), MacError> {
        let expected = self.seal();
        if received.len() == DIGEST_LEN && constant_time_compare(&expected, received) {
            Ok(())
        } else {
            Err(MacError::VerificationFailed)
        }
    }
}

/// Constant-time comparison to prevent timing attacks
#[inline]
fn constant_time_compare(a: &[u8; DIGEST_LEN], b: &[u8]) -> bool {
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StreamKey {
        StreamKey::new(vec![42u8; 32]).unwrap()
    }

    #[test]
    fn test_chain_verifies_in_order() {
        let mut sender = ChainedMac::new(&key()).unwrap();
        let mut receiver = ChainedMac::new(&key()).unwrap();

        for frame in [&b"first"[..], b"second", b"third"] {
            sender.update(frame);
            let digest = sender.seal();
            receiver.update(frame);
            assert!(receiver.verify(&digest).is_ok());
        }
    }

    #[test]
    fn test_digest_depends_on_history() {
        let mut fresh = ChainedMac::new(&key()).unwrap();
        fresh.update(b"second");
        let standalone = fresh.seal();

        let mut chained = ChainedMac::new(&key()).unwrap();
        chained.update(b"first");
        chained.seal();
        chained.update(b"second");
        let after_first = chained.seal();

        assert_ne!(standalone, after_first);
    }

    #[test]
    fn test_reordered_frames_fail() {
        let mut sender = ChainedMac::new(&key()).unwrap();
        sender.update(b"a");
        let d1 = sender.seal();
        sender.update(b"b");
        let d2 = sender.seal();

        let mut receiver = ChainedMac::new(&key()).unwrap();
        receiver.update(b"b");
        assert!(receiver.verify(&d2).is_err());

        let mut receiver = ChainedMac::new(&key()).unwrap();
        receiver.update(b"a");
        assert!(receiver.verify(&d1).is_ok());
    }

    #[test]
    fn test_wrong_key() {
        let mut sender = ChainedMac::new(&key()).unwrap();
        let mut receiver = ChainedMac::new(&StreamKey::new(vec![7u8; 32]).unwrap()).unwrap();
        sender.update(b"payload");
        receiver.update(b"payload");
        assert!(receiver.verify(&sender.seal()).is_err());
    }

    #[test]
    fn test_short_digest_rejected() {
        let mut receiver = ChainedMac::new(&key()).unwrap();
        receiver.update(b"payload");
        assert!(receiver.verify(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_key_from_hex() {
        let key = StreamKey::from_hex("00ff10").unwrap();
        assert_eq!(key.as_bytes(), &[0x00, 0xff, 0x10]);
        assert!(StreamKey::from_hex("").is_err());
        assert!(StreamKey::from_hex("zz").is_err());
    }
}
