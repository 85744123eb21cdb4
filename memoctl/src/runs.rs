//! Status records for analysis runs.

use crate::db::{
    errors::{DbError, Result},
    handlers::{AnalysisRuns, Repository, analysis_runs::AnalysisRunFilter},
    models::analysis_runs::{AnalysisRunCreateDBRequest, AnalysisRunDBResponse, AnalysisRunUpdateDBRequest, RunStatus},
};
use crate::types::{ActorId, JobId, RunId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type AnalysisRun = AnalysisRunDBResponse;
pub type RunOutcome = AnalysisRunUpdateDBRequest;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, job_id: JobId, actor_id: ActorId) -> Result<AnalysisRun>;
    async fn finish(&self, id: RunId, outcome: &RunOutcome) -> Result<AnalysisRun>;
    async fn get(&self, id: RunId) -> Result<Option<AnalysisRun>>;
    /// Most recent first.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AnalysisRun>>;
}

pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create(&self, job_id: JobId, actor_id: ActorId) -> Result<AnalysisRun> {
        let mut conn = self.pool.acquire().await?;
        AnalysisRuns::new(&mut conn)
            .create(&AnalysisRunCreateDBRequest { job_id, actor_id })
            .await
    }

    async fn finish(&self, id: RunId, outcome: &RunOutcome) -> Result<AnalysisRun> {
        let mut conn = self.pool.acquire().await?;
        AnalysisRuns::new(&mut conn).update(id, outcome).await
    }

    async fn get(&self, id: RunId) -> Result<Option<AnalysisRun>> {
        let mut conn = self.pool.acquire().await?;
        AnalysisRuns::new(&mut conn).get_by_id(id).await
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AnalysisRun>> {
        let mut conn = self.pool.acquire().await?;
        AnalysisRuns::new(&mut conn).list(&AnalysisRunFilter::for_job(job_id)).await
    }
}

/// [`RunStore`] kept in process memory.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<Vec<AnalysisRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, job_id: JobId, actor_id: ActorId) -> Result<AnalysisRun> {
        let run = AnalysisRun {
            id: Uuid::new_v4(),
            job_id,
            actor_id,
            status: RunStatus::Running,
            file_count: 0,
            batch_count: 0,
            failed_batches: 0,
            artifact_path: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.runs.write().await.push(run.clone());
        Ok(run)
    }

    async fn finish(&self, id: RunId, outcome: &RunOutcome) -> Result<AnalysisRun> {
        let mut runs = self.runs.write().await;
        let run = runs.iter_mut().find(|r| r.id == id).ok_or(DbError::NotFound)?;
        run.status = outcome.status;
        run.file_count = outcome.file_count;
        run.batch_count = outcome.batch_count;
        run.failed_batches = outcome.failed_batches;
        run.artifact_path = outcome.artifact_path.clone();
        run.error = outcome.error.clone();
        run.finished_at = (outcome.status != RunStatus::Running).then(Utc::now);
        Ok(run.clone())
    }

    async fn get(&self, id: RunId) -> Result<Option<AnalysisRun>> {
        Ok(self.runs.read().await.iter().find(|r| r.id == id).cloned())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<AnalysisRun>> {
        let mut runs: Vec<AnalysisRun> = self.runs.read().await.iter().filter(|r| r.job_id == job_id).cloned().collect();
        runs.reverse();
        Ok(runs)
    }
}
