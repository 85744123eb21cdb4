//! Spreadsheet export of a job's attribute records.

use super::AnalysisError;
use super::json::AttributeRecord;
use crate::catalog::FileCatalog;
use crate::storage::BlobStorage;
use crate::types::{ActorId, JobId};
use bytes::Bytes;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, instrument};
use uuid::Uuid;

pub const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const SHEET_NAME: &str = "Sheet1";
/// Longest text a spreadsheet cell accepts.
const MAX_CELL_CHARS: usize = 32_767;

/// Where an exported spreadsheet was written and how it is catalogued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDescriptor {
    pub catalog_id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
}

/// Sorted union of every record's columns.
pub fn header(records: &[AttributeRecord]) -> Vec<String> {
    records
        .iter()
        .flat_map(|record| record.columns())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(String::from)
        .collect()
}

fn cell_text(value: &str) -> &str {
    match value.char_indices().nth(MAX_CELL_CHARS) {
        Some((cut, _)) => &value[..cut],
        None => value,
    }
}

/// One header row, then one row per record. Missing cells stay empty.
pub fn render_workbook(columns: &[String], records: &[AttributeRecord]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, name) in columns.iter().enumerate() {
        let col = u16::try_from(col).map_err(|_| XlsxError::RowColumnLimitError)?;
        worksheet.write_string_with_format(0, col, cell_text(name), &bold)?;
    }
    for (index, record) in records.iter().enumerate() {
        let row = u32::try_from(index + 1).map_err(|_| XlsxError::RowColumnLimitError)?;
        for (col, name) in columns.iter().enumerate() {
            if let Some(value) = record.get(name) {
                let col = u16::try_from(col).map_err(|_| XlsxError::RowColumnLimitError)?;
                worksheet.write_string(row, col, cell_text(value))?;
            }
        }
    }

    workbook.save_to_buffer()
}

fn persist_failure(e: impl ToString) -> AnalysisError {
    AnalysisError::ArtifactPersistFailure(e.to_string())
}

pub struct ResultExporter {
    source_dir: PathBuf,
    output_suffix: String,
    catalog: Arc<dyn FileCatalog>,
    blobs: Arc<dyn BlobStorage>,
}

impl ResultExporter {
    pub fn new(source_dir: PathBuf, output_suffix: impl Into<String>, catalog: Arc<dyn FileCatalog>, blobs: Arc<dyn BlobStorage>) -> Self {
        Self {
            source_dir,
            output_suffix: output_suffix.into(),
            catalog,
            blobs,
        }
    }

    /// Stored name of a job's artifact: `{actor}_{job}_{suffix}`.
    pub fn artifact_name(&self, job_id: JobId, actor_id: ActorId) -> String {
        format!("{actor_id}_{job_id}_{}", self.output_suffix)
    }

    /// Write the records to `{source_dir}/{actor}_{job}_{suffix}` and register the file for the job.
    #[instrument(skip(self, records), fields(records = records.len()), err)]
    pub async fn export(&self, records: &[AttributeRecord], job_id: JobId, actor_id: ActorId) -> Result<ArtifactDescriptor, AnalysisError> {
        let columns = header(records);
        let buffer = {
            let columns = columns.clone();
            let records = records.to_vec();
            tokio::task::spawn_blocking(move || render_workbook(&columns, &records))
                .await
                .map_err(persist_failure)?
                .map_err(persist_failure)?
        };

        let file_name = self.artifact_name(job_id, actor_id);
        let path = self.source_dir.join(&file_name);
        tokio::fs::create_dir_all(&self.source_dir)
            .await
            .map_err(persist_failure)?;
        tokio::fs::write(&path, &buffer).await.map_err(persist_failure)?;

        let stored = self
            .catalog
            .register(job_id, actor_id, &file_name)
            .await
            .map_err(persist_failure)?;

        info!(path = %path.display(), rows = records.len(), columns = columns.len(), "Exported analysis results");
        Ok(ArtifactDescriptor {
            catalog_id: stored.id,
            file_name,
            path,
            rows: records.len(),
            columns,
        })
    }

    /// Copy the artifact to blob storage in the background and record its remote id. Failures are
    /// only logged.
    pub fn spawn_upload(&self, artifact: &ArtifactDescriptor) -> JoinHandle<()> {
        let blobs = self.blobs.clone();
        let catalog = self.catalog.clone();
        let artifact = artifact.clone();
        let span = info_span!("upload_artifact", file_name = %artifact.file_name);

        tokio::spawn(
            async move {
                let content = match tokio::fs::read(&artifact.path).await {
                    Ok(content) => Bytes::from(content),
                    Err(e) => {
                        error!(error = %e, "Failed to read artifact for upload");
                        return;
                    }
                };
                let remote_id = match blobs.upload(&artifact.file_name, XLSX_CONTENT_TYPE, content).await {
                    Ok(remote_id) => remote_id,
                    Err(e) => {
                        error!(error = %e, "Failed to upload artifact");
                        return;
                    }
                };
                match catalog.set_remote_id(artifact.catalog_id, &remote_id).await {
                    Ok(_) => info!(remote_id = %remote_id, "Uploaded artifact"),
                    Err(e) => error!(error = %e, remote_id = %remote_id, "Uploaded artifact but failed to record its remote id"),
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryFileCatalog;
    use crate::storage::LocalBlobStorage;
    use calamine::{Reader, Xlsx, open_workbook};
    use serde_json::json;

    fn read_sheet(path: &std::path::Path) -> Vec<Vec<String>> {
        let mut workbook: Xlsx<_> = open_workbook(path).unwrap();
        assert_eq!(workbook.sheet_names(), vec![SHEET_NAME.to_string()]);
        let range = workbook.worksheet_range(SHEET_NAME).unwrap();
        range.rows().map(|row| row.iter().map(|cell| cell.to_string()).collect()).collect()
    }

    #[test]
    fn header_is_sorted_union() {
        let records = vec![
            AttributeRecord::from_entry("a.jpg", &json!({"total": "1", "date": "x"})),
            AttributeRecord::failed("b.jpg"),
        ];
        assert_eq!(header(&records), vec!["date", "error", "fileName", "total"]);
        assert!(header(&[]).is_empty());
    }

    #[test]
    fn long_cells_are_truncated() {
        let long = "가".repeat(MAX_CELL_CHARS + 10);
        assert_eq!(cell_text(&long).chars().count(), MAX_CELL_CHARS);
        assert_eq!(cell_text("short"), "short");
    }

    #[tokio::test]
    async fn writes_registers_and_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(InMemoryFileCatalog::new());
        let blobs = Arc::new(LocalBlobStorage::new(dir.path().join("blobs")));
        let exporter = ResultExporter::new(dir.path().join("uploads"), "output.xlsx", catalog.clone(), blobs.clone());

        let records = vec![
            AttributeRecord::from_entry("a.jpg", &json!({"total": "12", "items": [1, 2]})),
            AttributeRecord::failed("b.jpg"),
        ];
        let artifact = exporter.export(&records, 31, 7).await.unwrap();

        assert_eq!(artifact.file_name, "7_31_output.xlsx");
        assert_eq!(artifact.path, dir.path().join("uploads").join("7_31_output.xlsx"));
        assert_eq!(artifact.columns, vec!["error", "fileName", "items", "total"]);

        let rows = read_sheet(&artifact.path);
        assert_eq!(rows[0], vec!["error", "fileName", "items", "total"]);
        assert_eq!(rows[1], vec!["", "a.jpg", "[1,2]", "12"]);
        assert_eq!(rows[2], vec!["Analysis failed", "b.jpg", "", ""]);

        let registered = catalog.list_files(31).await.unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].file_name, "7_31_output.xlsx");
        assert_eq!(registered[0].created_by, 7);

        exporter.spawn_upload(&artifact).await.unwrap();
        let uploaded = catalog.list_files(31).await.unwrap();
        let remote_id = uploaded[0].remote_id.clone().expect("remote id recorded");
        assert!(blobs.exists(&remote_id).await.unwrap());
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let exporter = ResultExporter::new(
            blocker,
            "output.xlsx",
            Arc::new(InMemoryFileCatalog::new()),
            Arc::new(LocalBlobStorage::new(dir.path().join("blobs"))),
        );

        let result = exporter.export(&[AttributeRecord::failed("a.jpg")], 1, 1).await;
        assert!(matches!(result, Err(AnalysisError::ArtifactPersistFailure(_))));
    }
}
