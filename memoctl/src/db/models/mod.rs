pub mod analysis_runs;
pub mod files;
pub mod quota_keys;
