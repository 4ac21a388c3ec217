//! Access-token plumbing.
//!
//! The OAuth consent and refresh handshake is owned by an external
//! collaborator; the engine only needs a bearer token per request. The
//! stored-token provider replays whatever that collaborator last wrote
//! under the credentials directory.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Result, SyncError};

/// Name of the token file inside the credentials directory.
const TOKEN_FILE: &str = "token.json";

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Reads the cached bearer token the credential helper maintains.
#[derive(Debug, Clone)]
pub struct StoredTokenProvider {
    credentials_dir: PathBuf,
}

#[derive(Deserialize)]
struct StoredToken {
    access_token: String,
}

impl StoredTokenProvider {
    pub fn new(credentials_dir: impl Into<PathBuf>) -> Self {
        Self {
            credentials_dir: credentials_dir.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StoredTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let path = self.credentials_dir.join(TOKEN_FILE);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
            SyncError::Internal(format!(
                "cannot read stored credentials {}: {err}",
                path.display()
            ))
        })?;
        let token: StoredToken = serde_json::from_str(&raw)
            .map_err(|err| SyncError::Parse(format!("stored credentials: {err}")))?;
        Ok(token.access_token)
    }
}

/// Fixed token for tests and offline tooling.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
