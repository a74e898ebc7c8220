//! OAuth token cache.
//!
//! Providers that authenticate via OAuth keep their tokens in a per-provider
//! directory: `access_token.json` and `refresh_token.json`. Writes are
//! atomic (tmp + rename) so a crashed process never leaves a torn file.
//! The cache is an injected handle — no process-wide token state.

use crate::error::{ErrorCode, PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Clock skew subtracted from the token lifetime when checking expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessToken {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime in seconds from `created_at`.
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Epoch seconds at issue time.
    pub created_at: u64,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let lifetime = self.expires_in.saturating_sub(EXPIRY_SKEW.as_secs());
        now >= self.created_at.saturating_add(lifetime)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshToken {
    pub refresh_token: String,
}

/// File-backed token store for one provider.
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn access_path(&self) -> PathBuf {
        self.dir.join("access_token.json")
    }

    fn refresh_path(&self) -> PathBuf {
        self.dir.join("refresh_token.json")
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some(value))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(())
    }

    pub async fn load_access(&self) -> Result<Option<AccessToken>> {
        Self::read_json(&self.access_path()).await
    }

    pub async fn store_access(&self, token: &AccessToken) -> Result<()> {
        self.write_json(&self.access_path(), token).await
    }

    pub async fn load_refresh(&self) -> Result<Option<RefreshToken>> {
        Self::read_json(&self.refresh_path()).await
    }

    pub async fn store_refresh(&self, token: &RefreshToken) -> Result<()> {
        self.write_json(&self.refresh_path(), token).await
    }

    /// Remove both token files. Missing files are not an error.
    pub async fn clear(&self) -> Result<()> {
        for path in [self.access_path(), self.refresh_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path, err)),
            }
        }
        Ok(())
    }
}

fn io_error(path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::new(
        ErrorCode::RESOURCE_EXHAUSTED,
        format!("token cache I/O failure at {}: {}", path.display(), err),
    )
}
