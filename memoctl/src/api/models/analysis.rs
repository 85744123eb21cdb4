use crate::types::{ActorId, JobId, RunId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Start analysing every file of a job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerAnalysisRequest {
    #[schema(value_type = i64)]
    pub job_id: JobId,
    #[schema(value_type = i64)]
    pub actor_id: ActorId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerAnalysisResponse {
    /// Poll `/analysis/runs/{run_id}` for the outcome
    #[schema(value_type = String, format = "uuid")]
    pub run_id: RunId,
}
