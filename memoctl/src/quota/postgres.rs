use super::{ApiKeyRecord, KeySelector, QuotaError, QuotaStore, Result, UsageMap, parse_usage};
use crate::db::{errors::DbError, handlers::QuotaKeys};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{instrument, warn};

/// [`QuotaStore`] backed by the `codes` table.
pub struct PostgresQuotaStore {
    pool: PgPool,
    selector: KeySelector,
}

impl PostgresQuotaStore {
    pub fn new(pool: PgPool, selector: KeySelector) -> Self {
        Self { pool, selector }
    }
}

#[async_trait]
impl QuotaStore for PostgresQuotaStore {
    #[instrument(skip(self), fields(group = %self.selector.group), err)]
    async fn list_active_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let rows = QuotaKeys::new(&mut conn)
            .list_active(&self.selector.group, &self.selector.prefix)
            .await?;

        let keys: Vec<ApiKeyRecord> = rows
            .into_iter()
            .filter_map(|row| match row.secret.filter(|s| !s.trim().is_empty()) {
                Some(secret) => Some(ApiKeyRecord {
                    usage_count: parse_usage(row.usage_raw.as_deref()),
                    group: row.group,
                    code: row.code,
                    secret,
                    active: row.active,
                }),
                None => {
                    warn!(code = %row.code, "API key row has no secret, skipping");
                    None
                }
            })
            .collect();

        if keys.is_empty() {
            return Err(QuotaError::NoCredentialsAvailable);
        }
        Ok(keys)
    }

    #[instrument(skip(self, usage), fields(keys = usage.len(), calls = usage.total()), err)]
    async fn commit_usage(&self, usage: &UsageMap) -> Result<()> {
        if usage.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        {
            let mut repo = QuotaKeys::new(&mut tx);
            for (secret, calls) in usage.iter() {
                let touched = repo.add_usage(&self.selector.group, secret, i64::from(calls)).await?;
                if touched == 0 {
                    warn!(calls, "Usage recorded for a key that no longer exists");
                }
            }
        }
        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(group = %self.selector.group), err)]
    async fn reset_usage(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let reset = QuotaKeys::new(&mut tx)
            .reset_usage(&self.selector.group, &self.selector.prefix)
            .await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(reset)
    }
}
