//! Database models for analysis runs.

use crate::types::{ActorId, JobId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow::anyhow!("unknown run status '{other}'")),
        }
    }
}

/// Database request for starting a run
#[derive(Debug, Clone)]
pub struct AnalysisRunCreateDBRequest {
    pub job_id: JobId,
    pub actor_id: ActorId,
}

/// Database request for finishing a run
#[derive(Debug, Clone)]
pub struct AnalysisRunUpdateDBRequest {
    pub status: RunStatus,
    pub file_count: i32,
    pub batch_count: i32,
    pub failed_batches: i32,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
}

impl AnalysisRunUpdateDBRequest {
    /// A run that aborted before producing anything.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            file_count: 0,
            batch_count: 0,
            failed_batches: 0,
            artifact_path: None,
            error: Some(error.into()),
        }
    }
}

/// Database response for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AnalysisRunDBResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: RunId,
    #[schema(value_type = i64)]
    pub job_id: JobId,
    #[schema(value_type = i64)]
    pub actor_id: ActorId,
    pub status: RunStatus,
    pub file_count: i32,
    pub batch_count: i32,
    pub failed_batches: i32,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
