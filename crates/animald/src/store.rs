//! Persisted results: one `<id>.json` file per successful classification.

use crate::response::UploadResponse;
use animal_core::GenderHint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid result id: {0:?}")]
    InvalidId(String),
    #[error("result not found: {0}")]
    NotFound(String),
    #[error("response has no id")]
    MissingId,
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed result: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    #[serde(flatten)]
    pub response: UploadResponse,
    pub gender: GenderHint,
    pub created_at: DateTime<Utc>,
}

pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        tracing::info!(dir = %dir.display(), "result store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn save(&self, response: &UploadResponse, gender: GenderHint) -> Result<StoredResult, StoreError> {
        let id = response.id.as_deref().ok_or(StoreError::MissingId)?;
        let path = self.path_for(id)?;
        let stored = StoredResult {
            response: response.clone(),
            gender,
            created_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&stored)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temporary result");
            }
            return Err(StoreError::Io { path, source });
        }

        tracing::debug!(id, path = %path.display(), "result saved");
        Ok(stored)
    }

    pub async fn load(&self, id: &str) -> Result<StoredResult, StoreError> {
        let path = self.path_for(id)?;
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(serde_json::from_slice(&body)?)
    }

    /// Only canonical UUIDs map to a file name.
    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let uuid = Uuid::parse_str(id).map_err(|_| StoreError::InvalidId(id.to_string()))?;
        Ok(self.dir.join(format!("{}.json", uuid.hyphenated())))
    }
}
