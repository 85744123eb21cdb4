//! API key quota tracking.
//!
//! A pool of generative-API keys is kept in the shared code table. Each key has a usage counter
//! that is incremented once per external call and reset once per day. [`QuotaStore`] reads and
//! writes those counters; [`KeyAllocator`] decides which keys a job may use.

pub mod allocator;
pub mod memory;
pub mod postgres;
pub mod reset;

use crate::db::errors::DbError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

pub use allocator::{AllocatedKey, Allocation, KeyAllocator, select_keys};
pub use memory::InMemoryQuotaStore;
pub use postgres::PostgresQuotaStore;
pub use reset::QuotaResetDaemon;

/// Which rows of the code table hold API keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelector {
    pub group: String,
    pub prefix: String,
}

/// A usable API key together with its usage in the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRecord {
    pub group: String,
    pub code: String,
    pub usage_count: u32,
    pub secret: String,
    pub active: bool,
}

/// Calls consumed per key secret during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageMap(BTreeMap<String, u32>);

impl UsageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `calls` to `secret`.
    pub fn record(&mut self, secret: &str, calls: u32) {
        let entry = self.0.entry(secret.to_string()).or_default();
        *entry = entry.saturating_add(calls);
    }

    pub fn get(&self, secret: &str) -> u32 {
        self.0.get(secret).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().map(|&calls| u64::from(calls)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(secret, &calls)| (secret.as_str(), calls))
    }
}

#[derive(Debug, Error)]
pub enum QuotaError {
    /// No active key exists in the configured group
    #[error("No API credentials are available")]
    NoCredentialsAvailable,

    /// The pool cannot cover the calls a job needs
    #[error("Insufficient API quota: {required} calls required, {remaining} remaining")]
    InsufficientQuota { required: u32, remaining: u64 },

    #[error(transparent)]
    Store(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Persistence of per-key usage counters.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Active keys in ascending code order. Fails with [`QuotaError::NoCredentialsAvailable`]
    /// when there are none.
    async fn list_active_keys(&self) -> Result<Vec<ApiKeyRecord>>;

    /// Add every entry of `usage` to its key's counter, all or nothing.
    async fn commit_usage(&self, usage: &UsageMap) -> Result<()>;

    /// Start a new cycle: every active key's counter goes back to 0. Returns the number of keys reset.
    async fn reset_usage(&self) -> Result<u64>;
}

/// Counters are stored as text; anything that is not a non-negative integer counts as 0.
pub fn parse_usage(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse::<u32>().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_usage_tolerates_garbage() {
        assert_eq!(parse_usage(Some("12")), 12);
        assert_eq!(parse_usage(Some(" 7 ")), 7);
        assert_eq!(parse_usage(Some("")), 0);
        assert_eq!(parse_usage(Some("abc")), 0);
        assert_eq!(parse_usage(Some("-3")), 0);
        assert_eq!(parse_usage(None), 0);
    }

    #[test]
    fn usage_map_accumulates_per_secret() {
        let mut usage = UsageMap::new();
        usage.record("k1", 1);
        usage.record("k1", 1);
        usage.record("k2", 3);

        assert_eq!(usage.get("k1"), 2);
        assert_eq!(usage.get("k2"), 3);
        assert_eq!(usage.get("missing"), 0);
        assert_eq!(usage.total(), 5);
        assert_eq!(usage.len(), 2);
        assert_eq!(usage.iter().map(|(s, _)| s).collect::<Vec<_>>(), vec!["k1", "k2"]);
    }
}
