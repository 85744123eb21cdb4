//! Sequential execution of batches against the generative API.

use super::AnalysisError;
use super::json::{AttributeRecord, try_parse_lenient};
use super::planner::{AnalysisBatch, FileDescriptor};
use super::prompt::batch_prompt;
use crate::generative::{BinaryPart, GenerativeClient};
use crate::quota::{Allocation, UsageMap};
use crate::storage::BlobStorage;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Result of running every batch of a job.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub records: Vec<AttributeRecord>,
    pub usage: UsageMap,
    pub batches: usize,
    pub failed_batches: usize,
    /// Batches that were sent, including one abandoned mid-call by a shutdown.
    pub attempted_batches: usize,
    /// Set when shutdown stopped the run before every batch was attempted.
    pub cancelled: bool,
}

/// Reads document bytes from the source directory, falling back to blob storage.
pub struct FileLoader {
    source_dir: PathBuf,
    blobs: Arc<dyn BlobStorage>,
}

impl FileLoader {
    pub fn new(source_dir: PathBuf, blobs: Arc<dyn BlobStorage>) -> Self {
        Self { source_dir, blobs }
    }

    pub async fn load(&self, file: &FileDescriptor) -> Result<BinaryPart, AnalysisError> {
        let load_error = |reason: String| AnalysisError::FileLoad {
            file_name: file.file_name.clone(),
            reason,
        };

        let relative = Path::new(&file.file_name);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(load_error("file name escapes the source directory".to_string()));
        }

        let data = match tokio::fs::read(self.source_dir.join(relative)).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match &file.remote_id {
                Some(remote_id) => {
                    debug!(file_name = %file.file_name, "Not on local disk, downloading from blob storage");
                    self.blobs.download(remote_id).await.map_err(|e| load_error(e.to_string()))?
                }
                None => return Err(load_error("file not found".to_string())),
            },
            Err(e) => return Err(load_error(e.to_string())),
        };

        Ok(BinaryPart {
            mime_type: file.mime_type.clone(),
            data,
        })
    }

    pub async fn load_batch(&self, batch: &AnalysisBatch) -> Result<Vec<BinaryPart>, AnalysisError> {
        futures::future::try_join_all(batch.files.iter().map(|file| self.load(file))).await
    }
}

pub struct AnalysisRunner {
    client: Arc<dyn GenerativeClient>,
    loader: FileLoader,
    inter_batch_delay: Duration,
    request_timeout: Duration,
    response_language: Option<String>,
}

impl AnalysisRunner {
    pub fn new(
        client: Arc<dyn GenerativeClient>,
        loader: FileLoader,
        inter_batch_delay: Duration,
        request_timeout: Duration,
        response_language: Option<String>,
    ) -> Self {
        Self {
            client,
            loader,
            inter_batch_delay,
            request_timeout,
            response_language,
        }
    }

    /// Run `batches` in order, rotating through the allocation's keys.
    ///
    /// Each attempted batch costs its key one call, whether it succeeds or not. A key is left
    /// once its remaining capacity reaches zero; when no further key exists the last one keeps
    /// being used. Batches that fail produce placeholder records for each of their files.
    ///
    /// When `shutdown` fires, the in-flight call is abandoned (and still charged) and no further
    /// batch is started.
    pub async fn run(&self, batches: &[AnalysisBatch], allocation: &Allocation, shutdown: &CancellationToken) -> RunOutput {
        let mut output = RunOutput {
            batches: batches.len(),
            ..RunOutput::default()
        };
        let keys = allocation.keys();
        if batches.is_empty() {
            return output;
        }
        if keys.is_empty() {
            warn!(batches = batches.len(), "No API keys allocated, every batch fails");
            for batch in batches {
                output.records.extend(batch.files.iter().map(|f| AttributeRecord::failed(f.display_name())));
            }
            output.failed_batches = batches.len();
            output.attempted_batches = batches.len();
            return output;
        }

        let capacity = i64::from(allocation.capacity());
        let mut current = 0;
        let mut remaining = capacity - i64::from(keys[current].usage);

        for (position, batch) in batches.iter().enumerate() {
            if shutdown.is_cancelled() {
                warn!(attempted = output.attempted_batches, total = batches.len(), "Shutdown requested, stopping analysis");
                output.cancelled = true;
                break;
            }
            if remaining < 1 {
                if current + 1 < keys.len() {
                    current += 1;
                    remaining = capacity - i64::from(keys[current].usage);
                    info!(key = %keys[current].code, "Rotating to next API key");
                } else {
                    warn!(key = %keys[current].code, "API keys exhausted, reusing last key");
                }
            }
            let key = &keys[current];

            let span = info_span!("analyze_batch", batch = batch.index, files = batch.files.len(), key = %key.code);
            let outcome = tokio::select! {
                outcome = self.analyze_batch(&key.secret, batch).instrument(span) => Some(outcome),
                _ = shutdown.cancelled() => None,
            };
            output.usage.record(&key.secret, 1);
            output.attempted_batches += 1;
            remaining -= 1;

            let Some(outcome) = outcome else {
                warn!(batch = batch.index, "Shutdown requested, abandoning in-flight batch");
                output.cancelled = true;
                break;
            };
            match outcome {
                Ok(records) => output.records.extend(records),
                Err(e) => {
                    warn!(batch = batch.index, error = %e, "Batch analysis failed");
                    output.failed_batches += 1;
                    output.records.extend(batch.files.iter().map(|f| AttributeRecord::failed(f.display_name())));
                }
            }

            if position + 1 < batches.len() && !self.inter_batch_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.inter_batch_delay) => {}
                    _ = shutdown.cancelled() => {}
                }
            }
        }

        output
    }

    async fn analyze_batch(&self, api_key: &str, batch: &AnalysisBatch) -> Result<Vec<AttributeRecord>, AnalysisError> {
        let failure = |reason: String| AnalysisError::BatchAnalysisFailure {
            batch: batch.index,
            reason,
        };

        let parts = self.loader.load_batch(batch).await.map_err(|e| failure(e.to_string()))?;
        let prompt = batch_prompt(&batch.files, self.response_language.as_deref());

        let text = tokio::time::timeout(self.request_timeout, self.client.generate(api_key, &prompt, &parts))
            .await
            .map_err(|_| failure(format!("timed out after {}", humantime::format_duration(self.request_timeout))))?
            .map_err(|e| failure(e.to_string()))?;

        let mut members = try_parse_lenient(&text).ok_or_else(|| failure("response did not contain a usable JSON object".to_string()))?;
        debug!(members = members.len(), "Parsed batch response");

        // Exactly one row per file, in batch order.
        let mut records = Vec::with_capacity(batch.files.len());
        let mut missing = Vec::new();
        for file in &batch.files {
            let name = file.display_name();
            match members.remove(name).or_else(|| members.remove(&file.file_name)) {
                Some(value) => records.push(AttributeRecord::from_entry(name, &value)),
                None => {
                    missing.push(name);
                    records.push(AttributeRecord::missing(name));
                }
            }
        }
        if missing.len() == batch.files.len() {
            return Err(failure("response described none of the batch's files".to_string()));
        }
        if !missing.is_empty() {
            warn!(missing = ?missing, "Response left out some files");
        }
        if !members.is_empty() {
            let unknown: Vec<&String> = members.keys().collect();
            warn!(unknown = ?unknown, "Ignoring response members that name no file in the batch");
        }
        Ok(records)
    }
}
