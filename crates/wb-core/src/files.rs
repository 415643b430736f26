use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub content: String,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub etag: Option<String>,
    pub create: bool,
    pub parents: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFileResponse {
    pub etag: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl From<&SaveFileResponse> for FileMetadata {
    fn from(response: &SaveFileResponse) -> Self {
        Self {
            size: response.size,
            modified_at: Some(response.modified_at),
            content_type: response.content_type.clone(),
            etag: Some(response.etag.clone()),
        }
    }
}

/// Failure kinds reported by a remote file store.
///
/// `PreconditionFailed` and `PreconditionRequired` stay separate because the
/// recovery differs: the first means another writer replaced the file (reload
/// it), the second means the caller sent no usable version token for a
/// replace/delete (refresh the listing).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileServiceError {
    #[error("precondition failed for {path}: file changed on the server")]
    PreconditionFailed { path: String },
    #[error("precondition required for {path}: latest version is missing")]
    PreconditionRequired { path: String },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl FileServiceError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::PreconditionFailed { .. } => Some(412),
            Self::PreconditionRequired { .. } => Some(428),
            Self::NotFound(_) => Some(404),
            Self::Transport(_) => None,
        }
    }
}

#[async_trait]
pub trait FileService: Send + Sync {
    async fn load_file(&self, id: &str) -> Result<LoadedFile, FileServiceError>;

    async fn save_file(&self, request: SaveFileRequest)
        -> Result<SaveFileResponse, FileServiceError>;
}
