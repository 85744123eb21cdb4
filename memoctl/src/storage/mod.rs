//! Blob storage for input documents and exported artifacts.

pub mod google_auth;
pub mod google_drive;
pub mod local;

use crate::config::StorageConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

pub use google_auth::{RefreshingToken, TokenSource};
pub use google_drive::GoogleDriveStorage;
pub use local::LocalBlobStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob {0} not found")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Storage backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Storage authentication failed: {0}")]
    Auth(String),

    #[error("Invalid storage configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Trait for blob storage backends
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Store `content` under a display `name` and return the backend's identifier for it
    async fn upload(&self, name: &str, content_type: &str, content: Bytes) -> Result<String>;

    /// Fetch the content stored under `id`
    async fn download(&self, id: &str) -> Result<Bytes>;

    /// Remove the blob. Returns false when it did not exist
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Check whether a blob exists
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// Create the configured storage backend
pub fn create_blob_storage(config: &StorageConfig, request_timeout: std::time::Duration) -> Result<Arc<dyn BlobStorage>> {
    match config {
        StorageConfig::Local { path } => Ok(Arc::new(LocalBlobStorage::new(path.clone()))),
        StorageConfig::GoogleDrive(drive) => {
            let tokens = match (&drive.credentials, &drive.access_token) {
                (Some(credentials), _) => TokenSource::Refreshing(RefreshingToken::new(drive.token_url.clone(), credentials.clone())),
                (None, Some(token)) => TokenSource::Static(token.clone()),
                (None, None) => {
                    return Err(StorageError::Config(
                        "Google Drive storage needs credentials or an access token".to_string(),
                    ));
                }
            };
            Ok(Arc::new(GoogleDriveStorage::new(
                drive.api_base_url.clone(),
                tokens,
                drive.folder_id.clone(),
                request_timeout,
            )?))
        }
    }
}
