use crate::auth::{TokenCache, TokenRecord};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use votewatch_core::CoreError;

/// Keeps the access token in a JSON file so restarts within the token's
/// lifetime skip the credential exchange.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    path: PathBuf,
}

impl FileTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenCache for FileTokenCache {
    async fn load(&self) -> Result<Option<TokenRecord>, CoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Io(e)),
        };

        let record = serde_json::from_slice(&raw)?;
        debug!("Loaded access token from {}", self.path.display());
        Ok(Some(record))
    }

    async fn store(&self, record: &TokenRecord) -> Result<(), CoreError> {
        let raw = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}
