//! CA bundle shared by every box of a process

use tracing::debug;

use crate::{BoxError, parse_pem};

/// Parsed trust anchors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustBundle {
    anchors: Vec<Vec<u8>>,
}

impl TrustBundle {
    /// Parse a bundle: a sequence of PEM blocks, or one raw DER blob
    pub fn parse(input: &[u8]) -> Result<Self, BoxError> {
        let blocks = parse_pem(input)?;
        let anchors: Vec<Vec<u8>> = if blocks.is_empty() {
            if input.is_empty() {
                Vec::new()
            } else {
                vec![input.to_vec()]
            }
        } else {
            blocks.into_iter().map(|b| b.data).collect()
        };

        debug!("Parsed trust bundle with {} anchors", anchors.len());
        Ok(Self { anchors })
    }

    pub fn anchors(&self) -> &[Vec<u8>] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}
