//! Filtering and batching of a job's input files.

use tracing::warn;

/// MIME type assumed when the name gives no hint.
pub const FALLBACK_MIME_TYPE: &str = "image/jpeg";

/// A file attached to a job, as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub file_name: String,
    pub remote_id: Option<String>,
}

impl SourceFile {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            remote_id: None,
        }
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }
}

/// A file accepted for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub mime_type: String,
    pub remote_id: Option<String>,
}

impl FileDescriptor {
    /// The name the user uploaded, without the `{actor}_{job}_` storage prefix.
    pub fn display_name(&self) -> &str {
        display_name(&self.file_name)
    }
}

/// Strip the `{actor}_{job}_` storage prefix. Names without one are returned unchanged.
pub fn display_name(stored: &str) -> &str {
    let mut parts = stored.splitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(rest)) if !a.is_empty() && !b.is_empty() => rest,
        _ => stored,
    }
}

/// Up to `batch_size` files sent in one external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisBatch {
    pub index: usize,
    pub files: Vec<FileDescriptor>,
}

/// Number of external calls needed for `files` files.
pub fn required_calls(files: usize, batch_size: usize) -> usize {
    files.div_ceil(batch_size.max(1))
}

pub struct BatchPlanner {
    output_suffix: String,
    supported_extensions: Vec<String>,
}

impl BatchPlanner {
    pub fn new(output_suffix: impl Into<String>, supported_extensions: &[String]) -> Self {
        Self {
            output_suffix: output_suffix.into(),
            supported_extensions: supported_extensions.iter().map(|e| e.trim_start_matches('.').to_ascii_lowercase()).collect(),
        }
    }

    fn is_supported(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((_, extension)) => {
                let extension = extension.to_ascii_lowercase();
                self.supported_extensions.iter().any(|e| *e == extension)
            }
            None => false,
        }
    }

    /// Drop previous artifacts and unsupported files, then split the rest into contiguous batches
    /// of at most `batch_size`, preserving input order.
    pub fn plan(&self, files: &[SourceFile], batch_size: usize) -> Vec<AnalysisBatch> {
        let accepted: Vec<FileDescriptor> = files
            .iter()
            .filter(|file| !file.file_name.is_empty())
            .filter(|file| !file.file_name.ends_with(&self.output_suffix))
            .filter(|file| {
                let supported = self.is_supported(&file.file_name);
                if !supported {
                    warn!(file_name = %file.file_name, "Skipping file with unsupported extension");
                }
                supported
            })
            .map(|file| FileDescriptor {
                file_name: file.file_name.clone(),
                mime_type: mime_guess::from_path(&file.file_name)
                    .first_raw()
                    .unwrap_or(FALLBACK_MIME_TYPE)
                    .to_string(),
                remote_id: file.remote_id.clone(),
            })
            .collect();

        accepted
            .chunks(batch_size.max(1))
            .enumerate()
            .map(|(index, chunk)| AnalysisBatch {
                index,
                files: chunk.to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> BatchPlanner {
        let extensions: Vec<String> = ["jpeg", "jpg", "png", "jfif", "gif", "webp", "pdf"].iter().map(|s| s.to_string()).collect();
        BatchPlanner::new("output.xlsx", &extensions)
    }

    fn files(names: &[&str]) -> Vec<SourceFile> {
        names.iter().map(|n| SourceFile::new(*n)).collect()
    }

    #[test]
    fn twelve_files_make_three_batches() {
        let names: Vec<String> = (1..=12).map(|i| format!("1_2_photo{i}.jpg")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let batches = planner().plan(&files(&refs), 5);

        assert_eq!(batches.iter().map(|b| b.files.len()).collect::<Vec<_>>(), vec![5, 5, 2]);
        assert_eq!(batches[2].index, 2);
        let flattened: Vec<&str> = batches.iter().flat_map(|b| b.files.iter().map(|f| f.file_name.as_str())).collect();
        assert_eq!(flattened, refs);
        assert_eq!(required_calls(12, 5), 3);
    }

    #[test]
    fn filters_artifacts_and_unsupported_files() {
        let batches = planner().plan(&files(&["1_2_a.PNG", "1_2_output.xlsx", "1_2_notes.txt", "1_2_scan.pdf", "noext", ""]), 5);
        assert_eq!(batches.len(), 1);
        let names: Vec<&str> = batches[0].files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["1_2_a.PNG", "1_2_scan.pdf"]);
        assert_eq!(batches[0].files[0].mime_type, "image/png");
        assert_eq!(batches[0].files[1].mime_type, "application/pdf");
    }

    #[test]
    fn no_supported_files_means_no_batches() {
        assert!(planner().plan(&files(&["a.docx", "b_c_output.xlsx"]), 5).is_empty());
        assert_eq!(required_calls(0, 5), 0);
    }

    #[test]
    fn zero_batch_size_is_treated_as_one() {
        assert_eq!(planner().plan(&files(&["a.jpg", "b.jpg"]), 0).len(), 2);
    }

    #[test]
    fn remote_ids_carry_through() {
        let batches = planner().plan(&[SourceFile::new("1_2_a.webp").with_remote_id("drive-1")], 5);
        assert_eq!(batches[0].files[0].remote_id.as_deref(), Some("drive-1"));
    }

    #[test]
    fn display_name_strips_storage_prefix() {
        assert_eq!(display_name("12_34_receipt_march.jpg"), "receipt_march.jpg");
        assert_eq!(display_name("receipt.jpg"), "receipt.jpg");
        assert_eq!(display_name("one_two.jpg"), "one_two.jpg");
        assert_eq!(display_name("_x_y.jpg"), "_x_y.jpg");
    }
}
