use super::{ApiKeyRecord, QuotaError, QuotaStore, Result, UsageMap};
use crate::db::errors::DbError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

/// [`QuotaStore`] kept in process memory, for tests and local runs without a database.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    keys: Mutex<Vec<ApiKeyRecord>>,
    fail_commits: AtomicBool,
}

impl InMemoryQuotaStore {
    pub fn new(keys: Vec<ApiKeyRecord>) -> Self {
        Self {
            keys: Mutex::new(keys),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Build active keys `{prefix}{n}` with the given usage counters and secrets `secret-{n}`.
    pub fn with_usage(group: &str, prefix: &str, usage: &[u32]) -> Self {
        let keys = usage
            .iter()
            .enumerate()
            .map(|(i, &usage_count)| ApiKeyRecord {
                group: group.to_string(),
                code: format!("{prefix}{}", i + 1),
                usage_count,
                secret: format!("secret-{}", i + 1),
                active: true,
            })
            .collect();
        Self::new(keys)
    }

    /// Make subsequent commits fail, as a lost database connection would.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Vec<ApiKeyRecord> {
        self.keys.lock().await.clone()
    }

    pub async fn usage_of(&self, secret: &str) -> Option<u32> {
        self.keys
            .lock()
            .await
            .iter()
            .find(|key| key.secret == secret)
            .map(|key| key.usage_count)
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn list_active_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let mut keys: Vec<ApiKeyRecord> = self.keys.lock().await.iter().filter(|key| key.active).cloned().collect();
        if keys.is_empty() {
            return Err(QuotaError::NoCredentialsAvailable);
        }
        keys.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(keys)
    }

    async fn commit_usage(&self, usage: &UsageMap) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(QuotaError::Store(DbError::Other(anyhow::anyhow!("quota store unavailable"))));
        }

        let mut keys = self.keys.lock().await;
        for (secret, calls) in usage.iter() {
            match keys.iter_mut().find(|key| key.secret == secret) {
                Some(key) => key.usage_count = key.usage_count.saturating_add(calls),
                None => warn!(calls, "Usage recorded for a key that no longer exists"),
            }
        }
        Ok(())
    }

    async fn reset_usage(&self) -> Result<u64> {
        let mut keys = self.keys.lock().await;
        let mut reset = 0;
        for key in keys.iter_mut().filter(|key| key.active) {
            key.usage_count = 0;
            reset += 1;
        }
        Ok(reset)
    }
}
