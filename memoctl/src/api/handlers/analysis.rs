//! Handlers for starting analysis jobs and following their runs.

use crate::AppState;
use crate::analysis::{AnalysisError, JobReport};
use crate::api::models::analysis::{TriggerAnalysisRequest, TriggerAnalysisResponse};
use crate::db::models::analysis_runs::RunStatus;
use crate::errors::{Error, Result};
use crate::runs::{AnalysisRun, RunOutcome};
use crate::types::{JobId, RunId, abbrev_uuid};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{Instrument, error, info, info_span};

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// How a finished job is recorded on its run.
fn run_outcome(result: std::result::Result<JobReport, AnalysisError>) -> RunOutcome {
    match result {
        Ok(report) => {
            let mut problems = Vec::new();
            if let Some(e) = &report.artifact_error {
                problems.push(format!("Export failed: {e}"));
            }
            if !report.usage_committed {
                problems.push("API key usage was not recorded".to_string());
            }
            RunOutcome {
                status: RunStatus::Completed,
                file_count: count(report.file_count),
                batch_count: count(report.batch_count),
                failed_batches: count(report.failed_batches),
                artifact_path: report.artifact.map(|a| a.path.display().to_string()),
                error: (!problems.is_empty()).then(|| problems.join("; ")),
            }
        }
        Err(e) => RunOutcome::failed(e.to_string()),
    }
}

#[utoipa::path(
    post,
    path = "/analysis/jobs",
    tag = "analysis",
    summary = "Analyse a job's files",
    description = "Starts analysing every supported file attached to the job. The work runs in the \
background; the returned run id can be polled for the outcome.",
    request_body = TriggerAnalysisRequest,
    responses(
        (status = 202, description = "Analysis started", body = TriggerAnalysisResponse),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all, fields(job_id = request.job_id))]
pub async fn trigger_analysis(
    State(state): State<AppState>,
    Json(request): Json<TriggerAnalysisRequest>,
) -> Result<(StatusCode, Json<TriggerAnalysisResponse>)> {
    let run = state.runs.create(request.job_id, request.actor_id).await?;
    let run_id = run.id;

    let analyzer = state.analyzer.clone();
    let runs = state.runs.clone();
    let span = info_span!("analysis_run", run_id = %abbrev_uuid(&run_id), job_id = request.job_id);
    state.jobs.spawn(
        async move {
            let outcome = run_outcome(analyzer.analyze_job(request.job_id, request.actor_id).await);
            info!(status = %outcome.status, "Run finished");
            if let Err(e) = runs.finish(run_id, &outcome).await {
                error!(error = %e, "Failed to record run outcome");
            }
        }
        .instrument(span),
    );

    Ok((StatusCode::ACCEPTED, Json(TriggerAnalysisResponse { run_id })))
}

#[utoipa::path(
    get,
    path = "/analysis/runs/{run_id}",
    tag = "analysis",
    summary = "Get run",
    params(("run_id" = uuid::Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run status", body = AnalysisRun),
        (status = 404, description = "Run not found"),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_run(State(state): State<AppState>, Path(run_id): Path<RunId>) -> Result<Json<AnalysisRun>> {
    let run = state.runs.get(run_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Analysis run".to_string(),
        id: run_id.to_string(),
    })?;
    Ok(Json(run))
}

#[utoipa::path(
    get,
    path = "/analysis/jobs/{job_id}/runs",
    tag = "analysis",
    summary = "List a job's runs",
    params(("job_id" = i64, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Runs, most recent first", body = Vec<AnalysisRun>),
        (status = 500, description = "Internal server error")
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_job_runs(State(state): State<AppState>, Path(job_id): Path<JobId>) -> Result<Json<Vec<AnalysisRun>>> {
    Ok(Json(state.runs.list_for_job(job_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaError, UsageMap};
    use crate::test_utils::{Reply, create_test_app, write_source_files};
    use std::time::Duration;

    async fn wait_for_run(server: &axum_test::TestServer, run_id: RunId) -> AnalysisRun {
        for _ in 0..100 {
            let run: AnalysisRun = server.get(&format!("/api/v1/analysis/runs/{run_id}")).await.json();
            if run.status != RunStatus::Running {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {run_id} did not finish");
    }

    #[test_log::test(tokio::test)]
    async fn trigger_runs_job_in_background() {
        let app = create_test_app(&[0], vec![Reply::text(r#"{"a.jpg": {"amount": "12"}}"#)]).await;
        write_source_files(app.source_dir(), &["3_8_a.jpg"]);
        app.catalog.add(8, 3, "3_8_a.jpg", None).await;

        let response = app
            .server
            .post("/api/v1/analysis/jobs")
            .json(&TriggerAnalysisRequest { job_id: 8, actor_id: 3 })
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let run_id = response.json::<TriggerAnalysisResponse>().run_id;

        let run = wait_for_run(&app.server, run_id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.file_count, 1);
        assert_eq!(run.batch_count, 1);
        assert_eq!(run.failed_batches, 0);
        assert!(run.artifact_path.unwrap().ends_with("3_8_output.xlsx"));
        assert!(run.error.is_none());
        assert_eq!(app.store.usage_of("secret-1").await, Some(1));

        let runs: Vec<AnalysisRun> = app.server.get("/api/v1/analysis/jobs/8/runs").await.json();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
    }

    #[tokio::test]
    async fn quota_failure_marks_run_failed() {
        let app = create_test_app(&[50], vec![]).await;
        app.catalog.add(8, 3, "3_8_a.jpg", None).await;

        let response = app
            .server
            .post("/api/v1/analysis/jobs")
            .json(&TriggerAnalysisRequest { job_id: 8, actor_id: 3 })
            .await;
        let run_id = response.json::<TriggerAnalysisResponse>().run_id;

        let run = wait_for_run(&app.server, run_id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("Insufficient API quota"));
        assert!(app.client.calls().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_drains_running_jobs_and_records_their_usage() {
        let app = create_test_app(&[0], vec![Reply::text(r#"{"a.jpg": {"amount": "1"}}"#), Reply::Hang]).await;
        let names = ["3_8_a.jpg", "3_8_b.jpg", "3_8_c.jpg"];
        write_source_files(app.source_dir(), &names);
        for name in names {
            app.catalog.add(8, 3, name, None).await;
        }

        let response = app
            .server
            .post("/api/v1/analysis/jobs")
            .json(&TriggerAnalysisRequest { job_id: 8, actor_id: 3 })
            .await;
        let run_id = response.json::<TriggerAnalysisResponse>().run_id;
        while app.client.calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        app.shutdown.cancel();
        app.jobs.close();
        tokio::time::timeout(Duration::from_secs(5), app.jobs.wait())
            .await
            .expect("jobs should stop on shutdown");

        let run: AnalysisRun = app.server.get(&format!("/api/v1/analysis/runs/{run_id}")).await.json();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("cancelled by shutdown after 2 of 3 batches"));
        assert_eq!(app.store.usage_of("secret-1").await, Some(2));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = create_test_app(&[0], vec![]).await;
        let response = app.server.get(&format!("/api/v1/analysis/runs/{}", uuid::Uuid::new_v4())).await;
        response.assert_status_not_found();
    }

    #[test]
    fn partial_success_is_recorded_as_completed_with_note() {
        let report = JobReport {
            job_id: 1,
            actor_id: 1,
            file_count: 4,
            batch_count: 2,
            failed_batches: 1,
            records: Vec::new(),
            usage: UsageMap::new(),
            usage_committed: false,
            artifact: None,
            artifact_error: Some("disk full".into()),
        };
        let outcome = run_outcome(Ok(report));
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Export failed: disk full; API key usage was not recorded")
        );

        let failed = run_outcome(Err(QuotaError::NoCredentialsAvailable.into()));
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("No API credentials are available"));
    }
}
