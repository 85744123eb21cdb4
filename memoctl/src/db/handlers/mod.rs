pub mod analysis_runs;
pub mod files;
pub mod quota_keys;
pub mod repository;

pub use analysis_runs::AnalysisRuns;
pub use files::Files;
pub use quota_keys::QuotaKeys;
pub use repository::Repository;
