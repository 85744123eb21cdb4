//! Database repository for the file catalog.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::files::{FileCreateDBRequest, FileDBResponse, FileUpdateDBRequest},
};
use crate::types::{ActorId, JobId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing catalog entries
#[derive(Debug, Clone)]
pub struct FileFilter {
    pub file_from: String,
    pub job_id: JobId,
}

impl FileFilter {
    pub fn new(file_from: impl Into<String>, job_id: JobId) -> Self {
        Self {
            file_from: file_from.into(),
            job_id,
        }
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct StoredFileRow {
    id: Uuid,
    file_from: String,
    job_id: JobId,
    file_name: String,
    remote_id: Option<String>,
    created_by: ActorId,
    created_at: DateTime<Utc>,
}

impl From<StoredFileRow> for FileDBResponse {
    fn from(row: StoredFileRow) -> Self {
        Self {
            id: row.id,
            file_from: row.file_from,
            job_id: row.job_id,
            file_name: row.file_name,
            remote_id: row.remote_id,
            created_by: row.created_by,
            created_at: row.created_at,
        }
    }
}

pub struct Files<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Files<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Files<'c> {
    type CreateRequest = FileCreateDBRequest;
    type UpdateRequest = FileUpdateDBRequest;
    type Response = FileDBResponse;
    type Id = Uuid;
    type Filter = FileFilter;

    /// Registering the same name twice for a job replaces the earlier entry.
    #[instrument(skip(self, request), fields(job_id = request.job_id, file_name = %request.file_name), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, StoredFileRow>(
            r#"
            INSERT INTO files (id, file_from, job_id, file_name, remote_id, created_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (file_from, job_id, file_name) DO UPDATE
            SET remote_id = EXCLUDED.remote_id,
                created_by = EXCLUDED.created_by,
                created_at = NOW()
            RETURNING id, file_from, job_id, file_name, remote_id, created_by, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.file_from)
        .bind(request.job_id)
        .bind(&request.file_name)
        .bind(&request.remote_id)
        .bind(request.created_by)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row.into())
    }

    #[instrument(skip(self), fields(file_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let row = sqlx::query_as::<_, StoredFileRow>(
            "SELECT id, file_from, job_id, file_name, remote_id, created_by, created_at FROM files WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(row.map(FileDBResponse::from))
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let rows = sqlx::query_as::<_, StoredFileRow>(
            r#"
            SELECT id, file_from, job_id, file_name, remote_id, created_by, created_at
            FROM files
            WHERE file_from = $1 AND job_id = $2
            ORDER BY created_at ASC, file_name ASC
            "#,
        )
        .bind(&filter.file_from)
        .bind(filter.job_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().map(FileDBResponse::from).collect())
    }

    #[instrument(skip(self, request), fields(file_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, StoredFileRow>(
            r#"
            UPDATE files
            SET remote_id = COALESCE($2, remote_id)
            WHERE id = $1
            RETURNING id, file_from, job_id, file_name, remote_id, created_by, created_at
            "#,
        )
        .bind(id)
        .bind(&request.remote_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(row.into())
    }
}
