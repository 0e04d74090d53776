use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Tokens returned by the authorization server, as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// True when the token expires before `now + leeway`. Tokens without an
    /// expiry never count as expiring.
    pub fn expires_within(&self, leeway: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|expires_at| expires_at <= now + leeway)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read token file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("token file '{path}' is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to create token directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write token file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize credential: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A single JSON credential record at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Returns `Ok(None)` when no record was ever written, so callers can tell
    /// "never authorized" apart from an unreadable or corrupt record.
    pub async fn load(&self) -> Result<Option<Credential>, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stored credential");
                return Ok(None);
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let credential: Credential =
            serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if credential.access_token.trim().is_empty() {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: "empty access token".to_string(),
            });
        }

        Ok(Some(credential))
    }

    pub async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let json = serde_json::to_string_pretty(credential)?;
        self.write_private(json.as_bytes())
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), "token stored");
        Ok(())
    }

    /// The record holds a refresh token, so on unix it is readable by the
    /// owner only, including when an older file is overwritten.
    async fn write_private(&self, contents: &[u8]) -> io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        #[cfg(unix)]
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await?;
        file.write_all(contents).await?;
        file.flush().await
    }
}
