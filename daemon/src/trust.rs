//! Process-wide CA bundle, loaded once on first use

use sigbox_cryptobox::{BoxError, TrustBundle};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Reading CA bundle {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Parsing CA bundle: {0}")]
    Parse(#[from] BoxError),
}

/// Lazily loaded trust anchors shared by every session
pub struct TrustCache {
    path: Option<PathBuf>,
    bundle: OnceCell<Arc<TrustBundle>>,
}

impl TrustCache {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            bundle: OnceCell::new(),
        }
    }

    /// No CA bundle configured
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_loaded(&self) -> bool {
        self.bundle.initialized()
    }

    /// The shared bundle, reading it on the first call.
    /// A failed read is retried by the next caller.
    pub async fn get(&self) -> Result<Option<Arc<TrustBundle>>, TrustError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(None);
        };

        let bundle = self
            .bundle
            .get_or_try_init(|| async {
                let raw = tokio::fs::read(path).await.map_err(|source| TrustError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                let bundle = TrustBundle::parse(&raw)?;
                info!(path = %path.display(), anchors = bundle.len(), "Loaded CA bundle");
                Ok::<_, TrustError>(Arc::new(bundle))
            })
            .await?;
        Ok(Some(bundle.clone()))
    }
}
