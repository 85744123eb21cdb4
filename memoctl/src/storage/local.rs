use super::{BlobStorage, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem storage backend - stores blobs in a directory
/// Useful for development and testing
pub struct LocalBlobStorage {
    base_path: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Resolve an id to a path under the base directory. Ids that would escape it resolve to nothing.
    fn resolve(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        if id.is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.base_path.join(relative))
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(&self, name: &str, _content_type: &str, content: Bytes) -> Result<String> {
        let blob_id = uuid::Uuid::new_v4();
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let relative_path = format!("{}/{}{}", blob_id.simple().to_string().chars().take(2).collect::<String>(), blob_id, extension);

        let full_path = self.base_path.join(&relative_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        Ok(relative_path)
    }

    async fn download(&self, id: &str) -> Result<Bytes> {
        let path = self.resolve(id).ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        match fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(path) = self.resolve(id) else {
            return Ok(false);
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self.resolve(id) {
            Some(path) => Ok(fs::try_exists(&path).await?),
            None => Ok(false),
        }
    }
}
