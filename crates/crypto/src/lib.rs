//! sigbox Crypto - Stream authentication and the primitives behind the
//! development crypto box
//!
//! This crate provides:
//! - Chained HMAC-SHA256 for authenticating a whole frame stream
//! - Unguessable session id generation
//! - Ed25519 signing keys
//! - AES-256-GCM password-protected key containers

mod aes;
mod keys;
mod session_id;
mod stream_mac;

pub use aes::*;
pub use keys::*;
pub use session_id::*;
pub use stream_mac::*;
