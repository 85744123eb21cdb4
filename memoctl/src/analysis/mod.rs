//! Batched document analysis.
//!
//! A job's files are filtered and split into batches ([`planner`]), keys covering one call per
//! batch are allocated, the batches are sent to the generative API one after another
//! ([`runner`]), the usage is committed, and the resulting records are written to a spreadsheet
//! ([`export`]).

pub mod export;
pub mod json;
pub mod planner;
pub mod prompt;
pub mod runner;

use crate::catalog::FileCatalog;
use crate::config::AnalyzerConfig;
use crate::db::errors::DbError;
use crate::generative::{BinaryPart, GenerativeClient};
use crate::quota::{KeyAllocator, QuotaError, UsageMap};
use crate::storage::BlobStorage;
use crate::types::{ActorId, JobId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

pub use export::{ArtifactDescriptor, ResultExporter};
pub use json::AttributeRecord;
pub use planner::{AnalysisBatch, BatchPlanner, FileDescriptor, SourceFile};
pub use runner::{AnalysisRunner, FileLoader, RunOutput};

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The key pool is empty or cannot cover the job. Raised before any external call.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// One batch could not be analysed. Recovered inside the runner.
    #[error("Batch {batch} failed: {reason}")]
    BatchAnalysisFailure { batch: usize, reason: String },

    #[error("Failed to load {file_name}: {reason}")]
    FileLoad { file_name: String, reason: String },

    /// The spreadsheet could not be written or registered. Usage stays committed.
    #[error("Failed to persist artifact: {0}")]
    ArtifactPersistFailure(String),

    #[error("Failed to list job files: {0}")]
    Catalog(#[from] DbError),

    /// Shutdown stopped the job part way. The calls made so far are committed, nothing is exported.
    #[error("Analysis cancelled by shutdown after {attempted} of {total} batches")]
    Cancelled { attempted: usize, total: usize },
}

/// What happened during one job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub actor_id: ActorId,
    pub file_count: usize,
    pub batch_count: usize,
    pub failed_batches: usize,
    pub records: Vec<AttributeRecord>,
    pub usage: UsageMap,
    pub usage_committed: bool,
    pub artifact: Option<ArtifactDescriptor>,
    pub artifact_error: Option<String>,
}

impl JobReport {
    fn empty(job_id: JobId, actor_id: ActorId) -> Self {
        Self {
            job_id,
            actor_id,
            file_count: 0,
            batch_count: 0,
            failed_batches: 0,
            records: Vec::new(),
            usage: UsageMap::new(),
            usage_committed: true,
            artifact: None,
            artifact_error: None,
        }
    }
}

/// Summary and advice for a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Advice {
    pub subject: String,
    pub advice: String,
}

impl Advice {
    const UNKNOWN_SUBJECT: &'static str = "Unknown";
    const NO_ADVICE: &'static str = "No advice could be generated.";

    fn from_response(text: &str) -> Option<Self> {
        let members = json::try_parse_lenient(text)?;
        let field = |name: &str| {
            members
                .get(name)
                .map(json::flatten_value)
                .filter(|value| !value.trim().is_empty())
        };
        Some(Self {
            subject: field("subject").unwrap_or_else(|| Self::UNKNOWN_SUBJECT.to_string()),
            advice: field("advice").unwrap_or_else(|| Self::NO_ADVICE.to_string()),
        })
    }

    fn failed(reason: &str) -> Self {
        Self {
            subject: "Analysis failed".to_string(),
            advice: format!("Error: {reason}"),
        }
    }
}

/// Runs analysis jobs and one-off advice requests against a shared key pool.
pub struct Analyzer {
    allocator: Arc<KeyAllocator>,
    client: Arc<dyn GenerativeClient>,
    catalog: Arc<dyn FileCatalog>,
    planner: BatchPlanner,
    runner: AnalysisRunner,
    exporter: ResultExporter,
    batch_size: usize,
    request_timeout: Duration,
    response_language: Option<String>,
    upload_artifacts: bool,
    shutdown: CancellationToken,
}

#[bon::bon]
impl Analyzer {
    #[builder]
    pub fn new(
        config: AnalyzerConfig,
        allocator: Arc<KeyAllocator>,
        client: Arc<dyn GenerativeClient>,
        blobs: Arc<dyn BlobStorage>,
        catalog: Arc<dyn FileCatalog>,
        #[builder(default)] upload_artifacts: bool,
        #[builder(default)] shutdown: CancellationToken,
    ) -> Self {
        let loader = FileLoader::new(config.source_dir.clone(), blobs.clone());
        let runner = AnalysisRunner::new(
            client.clone(),
            loader,
            config.inter_batch_delay,
            config.request_timeout,
            config.response_language.clone(),
        );
        let exporter = ResultExporter::new(config.source_dir.clone(), config.output_suffix.clone(), catalog.clone(), blobs);
        Self {
            planner: BatchPlanner::new(config.output_suffix.clone(), &config.supported_extensions),
            allocator,
            client,
            catalog,
            runner,
            exporter,
            batch_size: config.batch_size,
            request_timeout: config.request_timeout,
            response_language: config.response_language,
            upload_artifacts,
            shutdown,
        }
    }

    pub fn allocator(&self) -> &Arc<KeyAllocator> {
        &self.allocator
    }

    /// Analyse every file the catalog holds for `job_id`.
    #[instrument(skip(self), err)]
    pub async fn analyze_job(&self, job_id: JobId, actor_id: ActorId) -> Result<JobReport, AnalysisError> {
        let files: Vec<SourceFile> = self
            .catalog
            .list_files(job_id)
            .await?
            .into_iter()
            .map(|file| SourceFile {
                file_name: file.file_name,
                remote_id: file.remote_id,
            })
            .collect();
        self.analyze_files(&files, job_id, actor_id).await
    }

    /// Analyse `files` for one job and export the results.
    ///
    /// Fails before any external call when the key pool is empty or too small for the job. Once
    /// batches have run, their usage is committed even if the export fails or shutdown stops the
    /// job early.
    #[instrument(skip(self, files), fields(files = files.len()), err)]
    pub async fn analyze_files(&self, files: &[SourceFile], job_id: JobId, actor_id: ActorId) -> Result<JobReport, AnalysisError> {
        let batches = self.planner.plan(files, self.batch_size);
        if batches.is_empty() {
            info!("No supported files to analyse");
            return Ok(JobReport::empty(job_id, actor_id));
        }
        let file_count: usize = batches.iter().map(|b| b.files.len()).sum();

        let required = u32::try_from(batches.len()).unwrap_or(u32::MAX);
        let allocation = self.allocator.allocate(required).await?;
        info!(batches = batches.len(), keys = allocation.keys().len(), "Starting analysis");

        let output = self.runner.run(&batches, &allocation, &self.shutdown).await;

        let usage_committed = match self.allocator.commit(&allocation, &output.usage).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, calls = output.usage.total(), "API key usage was not recorded");
                false
            }
        };

        if output.cancelled {
            return Err(AnalysisError::Cancelled {
                attempted: output.attempted_batches,
                total: output.batches,
            });
        }

        let (artifact, artifact_error) = match self.exporter.export(&output.records, job_id, actor_id).await {
            Ok(artifact) => {
                if self.upload_artifacts {
                    // Detached: the upload outlives the job.
                    drop(self.exporter.spawn_upload(&artifact));
                }
                (Some(artifact), None)
            }
            Err(e) => {
                error!(error = %e, "Analysis finished but the results could not be exported");
                (None, Some(e.to_string()))
            }
        };

        info!(
            batches = output.batches,
            failed_batches = output.failed_batches,
            calls = output.usage.total(),
            "Analysis finished"
        );
        Ok(JobReport {
            job_id,
            actor_id,
            file_count,
            batch_count: output.batches,
            failed_batches: output.failed_batches,
            records: output.records,
            usage: output.usage,
            usage_committed,
            artifact,
            artifact_error,
        })
    }

    /// Summarise a note and give advice about it. One call is charged whether or not it succeeds;
    /// a failed call yields a fallback answer instead of an error.
    #[instrument(skip(self, body, files), fields(files = files.len()), err)]
    pub async fn advise(&self, title: &str, body: &str, files: &[(String, BinaryPart)]) -> Result<Advice, AnalysisError> {
        let allocation = self.allocator.allocate(1).await?;
        let Some(key) = allocation.keys().first() else {
            self.allocator.release(&allocation).await;
            return Err(QuotaError::NoCredentialsAvailable.into());
        };

        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        let parts: Vec<BinaryPart> = files.iter().map(|(_, part)| part.clone()).collect();
        let prompt = prompt::advice_prompt(title, body, &names, self.response_language.as_deref());

        let outcome = match tokio::time::timeout(self.request_timeout, self.client.generate(&key.secret, &prompt, &parts)).await {
            Ok(Ok(text)) => Advice::from_response(&text).ok_or_else(|| "response did not contain a usable JSON object".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}", humantime::format_duration(self.request_timeout))),
        };

        let mut usage = UsageMap::new();
        usage.record(&key.secret, 1);
        if let Err(e) = self.allocator.commit(&allocation, &usage).await {
            error!(error = %e, "API key usage was not recorded");
        }

        Ok(outcome.unwrap_or_else(|reason| {
            warn!(reason = %reason, "Advice request failed");
            Advice::failed(&reason)
        }))
    }

    /// Hand out one key for direct use by a client, charging it one call.
    pub async fn checkout_key(&self) -> Result<String, AnalysisError> {
        Ok(self.allocator.checkout().await?.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryFileCatalog;
    use crate::quota::InMemoryQuotaStore;
    use crate::storage::LocalBlobStorage;
    use crate::test_utils::{Reply, ScriptedClient, test_analyzer_config, write_source_files};
    use bytes::Bytes;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<InMemoryQuotaStore>,
        catalog: Arc<InMemoryFileCatalog>,
        client: Arc<ScriptedClient>,
        shutdown: CancellationToken,
        analyzer: Analyzer,
    }

    fn fixture(usage: &[u32], replies: Vec<Reply>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryQuotaStore::with_usage("CC004", "API_KEY", usage));
        let catalog = Arc::new(InMemoryFileCatalog::new());
        let client = Arc::new(ScriptedClient::new(replies));
        let config = test_analyzer_config(dir.path());
        let shutdown = CancellationToken::new();
        let analyzer = Analyzer::builder()
            .allocator(Arc::new(KeyAllocator::new(store.clone(), config.key_capacity)))
            .config(config)
            .client(client.clone())
            .blobs(Arc::new(LocalBlobStorage::new(dir.path().join("blobs"))))
            .catalog(catalog.clone())
            .shutdown(shutdown.clone())
            .build();
        Fixture {
            _dir: dir,
            store,
            catalog,
            client,
            shutdown,
            analyzer,
        }
    }

    #[test_log::test(tokio::test)]
    async fn job_commits_usage_and_exports() {
        let fx = fixture(
            &[48, 0],
            vec![
                Reply::text(r#"{"a.jpg": {"total": "1"}}"#),
                Reply::text(r#"{"b.jpg": {"total": "2"}}"#),
                Reply::text(r#"{"c.jpg": {"total": "3"}}"#),
            ],
        );
        let names = ["5_9_a.jpg", "5_9_b.jpg", "5_9_c.jpg"];
        write_source_files(fx._dir.path(), &names);
        for name in names {
            fx.catalog.add(9, 5, name, None).await;
        }
        // A previous artifact in the same job is ignored.
        fx.catalog.add(9, 5, "5_9_output.xlsx", None).await;

        // Batch size 1 in the test config gives three batches.
        let report = fx.analyzer.analyze_job(9, 5).await.unwrap();

        assert_eq!(report.batch_count, 3);
        assert_eq!(report.file_count, 3);
        assert!(report.usage_committed);
        assert_eq!(fx.client.keys_used(), vec!["secret-1", "secret-1", "secret-2"]);
        assert_eq!(fx.store.usage_of("secret-1").await, Some(50));
        assert_eq!(fx.store.usage_of("secret-2").await, Some(1));
        assert!(fx.analyzer.allocator().reserved().await.is_empty());

        let artifact = report.artifact.unwrap();
        assert_eq!(artifact.file_name, "5_9_output.xlsx");
        assert_eq!(artifact.rows, 3);
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn insufficient_quota_fails_before_any_call() {
        let fx = fixture(&[49], vec![]);
        let files = vec![SourceFile::new("1_1_a.jpg"), SourceFile::new("1_1_b.jpg")];

        let result = fx.analyzer.analyze_files(&files, 1, 1).await;

        assert!(matches!(
            result,
            Err(AnalysisError::Quota(QuotaError::InsufficientQuota { required: 2, remaining: 1 }))
        ));
        assert!(fx.client.calls().is_empty());
        assert_eq!(fx.store.usage_of("secret-1").await, Some(49));
    }

    #[tokio::test]
    async fn empty_pool_fails_before_any_call() {
        let fx = fixture(&[], vec![]);
        let result = fx.analyzer.analyze_files(&[SourceFile::new("1_1_a.jpg")], 1, 1).await;
        assert!(matches!(result, Err(AnalysisError::Quota(QuotaError::NoCredentialsAvailable))));
        assert!(fx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn nothing_supported_means_no_calls_and_no_artifact() {
        let fx = fixture(&[0], vec![]);
        let report = fx
            .analyzer
            .analyze_files(&[SourceFile::new("1_1_notes.docx"), SourceFile::new("1_1_output.xlsx")], 1, 1)
            .await
            .unwrap();
        assert_eq!(report.batch_count, 0);
        assert!(report.artifact.is_none());
        assert!(fx.client.calls().is_empty());
        assert_eq!(fx.store.usage_of("secret-1").await, Some(0));
    }

    #[tokio::test]
    async fn usage_commit_failure_does_not_lose_results() {
        let fx = fixture(&[0], vec![Reply::text(r#"{"a.jpg": {"x": "1"}}"#)]);
        write_source_files(fx._dir.path(), &["1_1_a.jpg"]);
        fx.store.set_fail_commits(true);

        let report = fx.analyzer.analyze_files(&[SourceFile::new("1_1_a.jpg")], 1, 1).await.unwrap();
        assert!(!report.usage_committed);
        assert_eq!(report.usage.get("secret-1"), 1);
        assert!(report.artifact.is_some());
        assert!(fx.analyzer.allocator().reserved().await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_commits_calls_made_and_skips_export() {
        let fx = fixture(&[0], vec![Reply::text(r#"{"a.jpg": {"x": "1"}}"#), Reply::Hang]);
        let names = ["1_4_a.jpg", "1_4_b.jpg", "1_4_c.jpg"];
        write_source_files(fx._dir.path(), &names);
        let files: Vec<SourceFile> = names.iter().map(|n| SourceFile::new(*n)).collect();

        let client = fx.client.clone();
        let trigger = fx.shutdown.clone();
        tokio::spawn(async move {
            while client.calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let result = fx.analyzer.analyze_files(&files, 4, 1).await;

        assert!(matches!(result, Err(AnalysisError::Cancelled { attempted: 2, total: 3 })));
        assert_eq!(fx.store.usage_of("secret-1").await, Some(2));
        assert!(fx.analyzer.allocator().reserved().await.is_empty());
        assert!(!fx._dir.path().join("1_4_output.xlsx").exists());
    }

    #[tokio::test]
    async fn advice_parses_subject_and_advice() {
        let fx = fixture(
            &[0],
            vec![Reply::text("```json\n{\"subject\": \"Trip budget\", \"advice\": \"Book early.\"}\n```")],
        );
        let files = vec![(
            "plan.png".to_string(),
            BinaryPart {
                mime_type: "image/png".into(),
                data: Bytes::from_static(b"png"),
            },
        )];

        let advice = fx.analyzer.advise("Trip", "Costs", &files).await.unwrap();
        assert_eq!(
            advice,
            Advice {
                subject: "Trip budget".into(),
                advice: "Book early.".into()
            }
        );
        assert!(fx.client.calls()[0].prompt.contains("Attached files: plan.png"));
        assert_eq!(fx.store.usage_of("secret-1").await, Some(1));
    }

    #[tokio::test]
    async fn advice_falls_back_and_still_charges() {
        let fx = fixture(&[0], vec![Reply::fail("model overloaded"), Reply::text("{\"advice\": \"\"}")]);

        let failed = fx.analyzer.advise("t", "b", &[]).await.unwrap();
        assert_eq!(failed.subject, "Analysis failed");
        assert!(failed.advice.contains("model overloaded"));

        let defaults = fx.analyzer.advise("t", "b", &[]).await.unwrap();
        assert_eq!(defaults.subject, "Unknown");
        assert_eq!(defaults.advice, "No advice could be generated.");

        assert_eq!(fx.store.usage_of("secret-1").await, Some(2));
    }

    #[tokio::test]
    async fn checkout_returns_first_usable_key() {
        let fx = fixture(&[50, 3], vec![]);
        assert_eq!(fx.analyzer.checkout_key().await.unwrap(), "secret-2");
        assert_eq!(fx.store.usage_of("secret-2").await, Some(4));
    }
}
