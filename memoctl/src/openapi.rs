//! OpenAPI document for the HTTP API, served at `/api-docs/openapi.json` and rendered with
//! Scalar at `/docs`.

use utoipa::OpenApi;

use crate::analysis::Advice;
use crate::api::handlers;
use crate::api::models::{analysis, quota};
use crate::db::models::analysis_runs::{AnalysisRunDBResponse, RunStatus};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "memoctl API",
        description = "Batch document analysis over a shared pool of generative-AI API keys."
    ),
    servers((url = "/api/v1")),
    paths(
        handlers::analysis::trigger_analysis,
        handlers::analysis::get_run,
        handlers::analysis::list_job_runs,
        handlers::advice::advise,
        handlers::quota::checkout_key,
        handlers::quota::list_key_usage,
        handlers::quota::reset_usage,
    ),
    components(schemas(
        analysis::TriggerAnalysisRequest,
        analysis::TriggerAnalysisResponse,
        AnalysisRunDBResponse,
        RunStatus,
        Advice,
        quota::CheckoutResponse,
        quota::KeyUsageResponse,
        quota::KeyUsageListResponse,
        quota::ResetResponse,
    )),
    tags(
        (name = "analysis", description = "Batched analysis of a job's files"),
        (name = "advice", description = "One-off advice for a note"),
        (name = "quota", description = "API key pool"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_route() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        for path in [
            "/analysis/jobs",
            "/analysis/runs/{run_id}",
            "/analysis/jobs/{job_id}/runs",
            "/advice",
            "/quota/checkout",
            "/quota/keys",
            "/quota/reset",
        ] {
            assert!(paths.contains(&path), "missing {path}");
        }
        assert!(!paths.contains(&"/healthz"));
    }
}
