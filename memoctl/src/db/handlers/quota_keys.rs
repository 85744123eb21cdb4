//! Database access for API key rows in the shared `codes` table.
//!
//! Keys are identified by a code group plus a code prefix. The usage counter lives in
//! `code_desc` as text and the secret in `remark`.

use crate::db::{errors::Result, models::quota_keys::QuotaKeyDBResponse};
use sqlx::{FromRow, PgConnection};
use tracing::instrument;

#[derive(Debug, Clone, FromRow)]
struct CodeRow {
    code_group: String,
    code: String,
    code_desc: Option<String>,
    remark: Option<String>,
    active: bool,
}

impl From<CodeRow> for QuotaKeyDBResponse {
    fn from(row: CodeRow) -> Self {
        Self {
            group: row.code_group,
            code: row.code,
            usage_raw: row.code_desc,
            secret: row.remark,
            active: row.active,
        }
    }
}

/// Escape LIKE wildcards in `prefix` and append `%`.
pub fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

pub struct QuotaKeys<'c> {
    db: &'c mut PgConnection,
}

impl<'c> QuotaKeys<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Active keys of `group` whose code starts with `prefix`, in ascending code order.
    #[instrument(skip(self), err)]
    pub async fn list_active(&mut self, group: &str, prefix: &str) -> Result<Vec<QuotaKeyDBResponse>> {
        let rows = sqlx::query_as::<_, CodeRow>(
            r#"
            SELECT code_group, code, code_desc, remark, use_yn = 'Y' AS active
            FROM codes
            WHERE code_group = $1
              AND use_yn = 'Y'
              AND code LIKE $2 ESCAPE '\'
            ORDER BY code ASC
            "#,
        )
        .bind(group)
        .bind(like_prefix(prefix))
        .fetch_all(&mut *self.db)
        .await?;

        Ok(rows.into_iter().map(QuotaKeyDBResponse::from).collect())
    }

    /// Add `calls` to the counter of the key holding `secret`. Unparsable counters restart from 0.
    /// Returns the number of rows touched.
    #[instrument(skip(self, secret), err)]
    pub async fn add_usage(&mut self, group: &str, secret: &str, calls: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE codes
            SET code_desc = (
                    CASE WHEN code_desc ~ '^\s*[0-9]+\s*$' THEN trim(code_desc)::bigint ELSE 0 END + $3
                )::text,
                updated_at = NOW()
            WHERE code_group = $1 AND remark = $2
            "#,
        )
        .bind(group)
        .bind(secret)
        .bind(calls)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Set the counter of every active key in the group back to 0.
    #[instrument(skip(self), err)]
    pub async fn reset_usage(&mut self, group: &str, prefix: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE codes
            SET code_desc = '0', updated_at = NOW()
            WHERE code_group = $1
              AND use_yn = 'Y'
              AND code LIKE $2 ESCAPE '\'
            "#,
        )
        .bind(group)
        .bind(like_prefix(prefix))
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
