//! sigbox CryptoBox - the key-holding collaborator behind every session
//!
//! This crate provides:
//! - The `CryptoBox` and `BoxFactory` traits the agent dispatches into
//! - `TrustBundle`, the CA material shared by all boxes of a process
//! - `SoftBox`, an Ed25519 development backend
//!
//! Production deployments plug their own `BoxFactory` into the agent.

mod error;
mod pem;
mod soft;
mod trust;

pub use error::*;
pub use pem::*;
pub use soft::*;
pub use trust::*;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sigbox_protocol::{ClearKey, Headers, PipeStep};
use std::sync::Arc;

/// Result of verifying/decrypting a container
#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    pub content: Bytes,
    pub meta: Value,
}

/// Holder of loaded keys and certificates.
///
/// Key material never leaves a box except through `export_keys`, which the
/// agent only calls on throwaway boxes (UNPROTECT).
#[async_trait]
pub trait CryptoBox: Send + Sync {
    /// Load private keys from one or more parts, decrypting with `password`
    async fn load_key(&mut self, parts: Vec<Bytes>, password: Option<&str>)
        -> Result<(), BoxError>;

    /// Load certificates from one or more parts
    async fn load_cert(&mut self, parts: Vec<Bytes>) -> Result<(), BoxError>;

    /// Attach the process-wide trust anchors
    fn load_trust_anchors(&mut self, bundle: Arc<TrustBundle>);

    /// Descriptions of the loaded keys/certificates, as sent in CERTS
    fn certificates(&self) -> Vec<Value>;

    /// Loaded private keys in clear PEM form
    fn export_keys(&self) -> Result<Vec<ClearKey>, BoxError>;

    /// Run the sign/encrypt pipeline over `content`
    async fn pipe(
        &self,
        content: Bytes,
        steps: &[PipeStep],
        headers: &Headers,
    ) -> Result<Bytes, BoxError>;

    /// Verify/decrypt `content`, with an optional detached second part
    async fn unwrap_content(
        &self,
        content: Bytes,
        second: Option<Bytes>,
        opts: &Value,
    ) -> Result<Unwrapped, BoxError>;

    /// Fetch certificates for the loaded keys from CMP endpoints.
    /// Returns how many were found.
    async fn find_certs_cmp(&mut self, urls: &[String]) -> Result<u64, BoxError>;
}

/// Creates empty boxes for new sessions
pub trait BoxFactory: Send + Sync {
    fn create(&self) -> Box<dyn CryptoBox>;
}
