//! Database repository for analysis runs.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::analysis_runs::{AnalysisRunCreateDBRequest, AnalysisRunDBResponse, AnalysisRunUpdateDBRequest, RunStatus},
};
use crate::types::{ActorId, JobId, RunId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing runs
#[derive(Debug, Clone)]
pub struct AnalysisRunFilter {
    pub job_id: JobId,
    pub limit: i64,
}

impl AnalysisRunFilter {
    pub fn for_job(job_id: JobId) -> Self {
        Self { job_id, limit: 100 }
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct AnalysisRunRow {
    id: RunId,
    job_id: JobId,
    actor_id: ActorId,
    status: String,
    file_count: i32,
    batch_count: i32,
    failed_batches: i32,
    artifact_path: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<AnalysisRunRow> for AnalysisRunDBResponse {
    type Error = DbError;

    fn try_from(row: AnalysisRunRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            actor_id: row.actor_id,
            status: row.status.parse::<RunStatus>()?,
            file_count: row.file_count,
            batch_count: row.batch_count,
            failed_batches: row.failed_batches,
            artifact_path: row.artifact_path,
            error: row.error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

const COLUMNS: &str =
    "id, job_id, actor_id, status, file_count, batch_count, failed_batches, artifact_path, error, created_at, finished_at";

pub struct AnalysisRuns<'c> {
    db: &'c mut PgConnection,
}

impl<'c> AnalysisRuns<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for AnalysisRuns<'c> {
    type CreateRequest = AnalysisRunCreateDBRequest;
    type UpdateRequest = AnalysisRunUpdateDBRequest;
    type Response = AnalysisRunDBResponse;
    type Id = RunId;
    type Filter = AnalysisRunFilter;

    #[instrument(skip(self, request), fields(job_id = request.job_id), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, AnalysisRunRow>(&format!(
            "INSERT INTO analysis_runs (id, job_id, actor_id, status) VALUES ($1, $2, $3, 'running') RETURNING {COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(request.job_id)
        .bind(request.actor_id)
        .fetch_one(&mut *self.db)
        .await?;

        row.try_into()
    }

    #[instrument(skip(self), fields(run_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let row = sqlx::query_as::<_, AnalysisRunRow>(&format!("SELECT {COLUMNS} FROM analysis_runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        row.map(AnalysisRunDBResponse::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let rows = sqlx::query_as::<_, AnalysisRunRow>(&format!(
            "SELECT {COLUMNS} FROM analysis_runs WHERE job_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(filter.job_id)
        .bind(filter.limit)
        .fetch_all(&mut *self.db)
        .await?;

        rows.into_iter().map(AnalysisRunDBResponse::try_from).collect()
    }

    #[instrument(skip(self, request), fields(run_id = %abbrev_uuid(&id), status = %request.status), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, AnalysisRunRow>(&format!(
            r#"
            UPDATE analysis_runs
            SET status = $2,
                file_count = $3,
                batch_count = $4,
                failed_batches = $5,
                artifact_path = $6,
                error = $7,
                finished_at = CASE WHEN $2 = 'running' THEN NULL ELSE NOW() END
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(request.status.as_str())
        .bind(request.file_count)
        .bind(request.batch_count)
        .bind(request.failed_batches)
        .bind(&request.artifact_path)
        .bind(&request.error)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        row.try_into()
    }
}
