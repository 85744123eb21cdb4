//! Catalog of files attached to jobs.
//!
//! Input documents are listed from here, and exported artifacts are registered here under the
//! same job so they show up next to the documents they summarise.

use crate::db::{
    errors::{DbError, Result},
    handlers::{Files, Repository, files::FileFilter},
    models::files::{FileCreateDBRequest, FileDBResponse, FileUpdateDBRequest},
};
use crate::types::{ActorId, FILE_FROM_MEMO, JobId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type StoredFile = FileDBResponse;

#[async_trait]
pub trait FileCatalog: Send + Sync {
    /// Files attached to a job, oldest first.
    async fn list_files(&self, job_id: JobId) -> Result<Vec<StoredFile>>;

    /// Record a file for a job. Re-registering a name replaces the earlier entry.
    async fn register(&self, job_id: JobId, actor_id: ActorId, file_name: &str) -> Result<StoredFile>;

    /// Remember where a file was uploaded to.
    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<StoredFile>;
}

pub struct PostgresFileCatalog {
    pool: PgPool,
}

impl PostgresFileCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileCatalog for PostgresFileCatalog {
    async fn list_files(&self, job_id: JobId) -> Result<Vec<StoredFile>> {
        let mut conn = self.pool.acquire().await?;
        Files::new(&mut conn).list(&FileFilter::new(FILE_FROM_MEMO, job_id)).await
    }

    async fn register(&self, job_id: JobId, actor_id: ActorId, file_name: &str) -> Result<StoredFile> {
        let mut conn = self.pool.acquire().await?;
        Files::new(&mut conn)
            .create(&FileCreateDBRequest {
                file_from: FILE_FROM_MEMO.to_string(),
                job_id,
                file_name: file_name.to_string(),
                remote_id: None,
                created_by: actor_id,
            })
            .await
    }

    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<StoredFile> {
        let mut conn = self.pool.acquire().await?;
        Files::new(&mut conn)
            .update(
                id,
                &FileUpdateDBRequest {
                    remote_id: Some(remote_id.to_string()),
                },
            )
            .await
    }
}

/// [`FileCatalog`] kept in process memory.
#[derive(Default)]
pub struct InMemoryFileCatalog {
    files: RwLock<Vec<StoredFile>>,
}

impl InMemoryFileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an existing document to a job.
    pub async fn add(&self, job_id: JobId, actor_id: ActorId, file_name: &str, remote_id: Option<&str>) -> StoredFile {
        let file = StoredFile {
            id: Uuid::new_v4(),
            file_from: FILE_FROM_MEMO.to_string(),
            job_id,
            file_name: file_name.to_string(),
            remote_id: remote_id.map(String::from),
            created_by: actor_id,
            created_at: Utc::now(),
        };
        self.files.write().await.push(file.clone());
        file
    }
}

#[async_trait]
impl FileCatalog for InMemoryFileCatalog {
    async fn list_files(&self, job_id: JobId) -> Result<Vec<StoredFile>> {
        Ok(self.files.read().await.iter().filter(|f| f.job_id == job_id).cloned().collect())
    }

    async fn register(&self, job_id: JobId, actor_id: ActorId, file_name: &str) -> Result<StoredFile> {
        let mut files = self.files.write().await;
        files.retain(|f| !(f.job_id == job_id && f.file_name == file_name));
        let file = StoredFile {
            id: Uuid::new_v4(),
            file_from: FILE_FROM_MEMO.to_string(),
            job_id,
            file_name: file_name.to_string(),
            remote_id: None,
            created_by: actor_id,
            created_at: Utc::now(),
        };
        files.push(file.clone());
        Ok(file)
    }

    async fn set_remote_id(&self, id: Uuid, remote_id: &str) -> Result<StoredFile> {
        let mut files = self.files.write().await;
        let file = files.iter_mut().find(|f| f.id == id).ok_or(DbError::NotFound)?;
        file.remote_id = Some(remote_id.to_string());
        Ok(file.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_replaces_same_name() {
        let catalog = InMemoryFileCatalog::new();
        catalog.add(1, 9, "9_1_a.jpg", None).await;
        let first = catalog.register(1, 9, "9_1_output.xlsx").await.unwrap();
        let second = catalog.register(1, 9, "9_1_output.xlsx").await.unwrap();

        let files = catalog.list_files(1).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.id == second.id));
        assert!(!files.iter().any(|f| f.id == first.id));
        assert!(catalog.list_files(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_id_is_recorded() {
        let catalog = InMemoryFileCatalog::new();
        let file = catalog.register(3, 1, "1_3_output.xlsx").await.unwrap();
        let updated = catalog.set_remote_id(file.id, "drive-7").await.unwrap();
        assert_eq!(updated.remote_id.as_deref(), Some("drive-7"));
        assert!(matches!(catalog.set_remote_id(Uuid::new_v4(), "x").await, Err(DbError::NotFound)));
    }
}
