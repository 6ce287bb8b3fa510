//! Repository over the `mailing_entries` table: one row per recipient,
//! upserted as the worker streams the CSV.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use error_types::{ErrorContext, MailerError, MailerResult};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{MailingEntry, MailingEntryStatus};

#[async_trait]
pub trait MailingEntryRepository: Send + Sync {
    /// Upsert keyed by `(mailing_id, email)` — the basis for at-least-once
    /// row processing without duplicate sends across redelivered attempts.
    async fn upsert_pending(
        &self,
        mailing_id: Uuid,
        email: &str,
        verification_token: &str,
    ) -> MailerResult<MailingEntry>;

    async fn mark_sending(&self, id: Uuid) -> MailerResult<()>;

    async fn mark_sent(&self, id: Uuid, external_id: &str) -> MailerResult<()>;

    async fn mark_failed(&self, id: Uuid, reason: &str) -> MailerResult<()>;

    async fn mark_invalid(
        &self,
        mailing_id: Uuid,
        email: &str,
        verification_token: &str,
        invalid_reason: &str,
        validation_details: serde_json::Value,
    ) -> MailerResult<()>;

    async fn find(&self, mailing_id: Uuid, email: &str) -> MailerResult<Option<MailingEntry>>;

    async fn count_by_status(&self, mailing_id: Uuid) -> MailerResult<StatusCounts>;

    /// Crash recovery step 1: stale SENDING rows reset to PENDING.
    async fn reset_stale_sending(&self, stale_threshold: Duration) -> MailerResult<u64>;

    /// Non-destructive count backing `checkRecoveryNeeded()` — how many
    /// rows step 1 would reset if run right now.
    async fn count_stale_sending(&self, stale_threshold: Duration) -> MailerResult<u64>;
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub invalid: i64,
}

pub struct SqlxMailingEntryRepository {
    pool: PgPool,
}

impl SqlxMailingEntryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<MailingEntry, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse::<MailingEntryStatus>()
            .map_err(|e| sqlx::Error::ColumnDecode { index: "status".to_string(), source: e.into() })?;

        Ok(MailingEntry {
            id: row.try_get("id")?,
            mailing_id: row.try_get("mailing_id")?,
            email: row.try_get("email")?,
            verification_token: row.try_get("verification_token")?,
            status,
            attempts: row.try_get("attempts")?,
            last_attempt: row.try_get("last_attempt")?,
            external_id: row.try_get("external_id")?,
            invalid_reason: row.try_get("invalid_reason")?,
            validation_details: row.try_get("validation_details")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl MailingEntryRepository for SqlxMailingEntryRepository {
    async fn upsert_pending(
        &self,
        mailing_id: Uuid,
        email: &str,
        verification_token: &str,
    ) -> MailerResult<MailingEntry> {
        let row = sqlx::query(
            r#"
            INSERT INTO mailing_entries (id, mailing_id, email, verification_token, status, attempts)
            VALUES ($1, $2, $3, $4, 'PENDING', 0)
            ON CONFLICT (mailing_id, email) DO UPDATE
                SET verification_token = EXCLUDED.verification_token,
                    updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mailing_id)
        .bind(email)
        .bind(verification_token)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert mailing entry")?;

        Self::row_to_entry(&row).context("failed to decode mailing entry")
    }

    async fn mark_sending(&self, id: Uuid) -> MailerResult<()> {
        sqlx::query(
            r#"
            UPDATE mailing_entries
            SET status = 'SENDING', attempts = attempts + 1, last_attempt = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark mailing entry sending")?;

        Ok(())
    }

    async fn mark_sent(&self, id: Uuid, external_id: &str) -> MailerResult<()> {
        sqlx::query(
            r#"
            UPDATE mailing_entries
            SET status = 'SENT', external_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .context("failed to mark mailing entry sent")?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> MailerResult<()> {
        let truncated: String = reason.chars().take(500).collect();
        sqlx::query(
            r#"
            UPDATE mailing_entries
            SET status = 'FAILED', invalid_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(truncated)
        .execute(&self.pool)
        .await
        .context("failed to mark mailing entry failed")?;

        Ok(())
    }

    async fn mark_invalid(
        &self,
        mailing_id: Uuid,
        email: &str,
        verification_token: &str,
        invalid_reason: &str,
        validation_details: serde_json::Value,
    ) -> MailerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mailing_entries (
                id, mailing_id, email, verification_token, status, attempts, invalid_reason, validation_details
            )
            VALUES ($1, $2, $3, $4, 'INVALID', 0, $5, $6)
            ON CONFLICT (mailing_id, email) DO UPDATE
                SET status = 'INVALID',
                    invalid_reason = EXCLUDED.invalid_reason,
                    validation_details = EXCLUDED.validation_details,
                    updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mailing_id)
        .bind(email)
        .bind(verification_token)
        .bind(invalid_reason)
        .bind(validation_details)
        .execute(&self.pool)
        .await
        .context("failed to upsert invalid mailing entry")?;

        Ok(())
    }

    async fn find(&self, mailing_id: Uuid, email: &str) -> MailerResult<Option<MailingEntry>> {
        let row = sqlx::query(
            r#"SELECT * FROM mailing_entries WHERE mailing_id = $1 AND email = $2"#,
        )
        .bind(mailing_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up mailing entry")?;

        row.as_ref().map(Self::row_to_entry).transpose().context("failed to decode mailing entry")
    }

    async fn count_by_status(&self, mailing_id: Uuid) -> MailerResult<StatusCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING')::BIGINT AS pending,
                COUNT(*) FILTER (WHERE status = 'SENDING')::BIGINT AS sending,
                COUNT(*) FILTER (WHERE status = 'SENT')::BIGINT AS sent,
                COUNT(*) FILTER (WHERE status = 'FAILED')::BIGINT AS failed,
                COUNT(*) FILTER (WHERE status = 'INVALID')::BIGINT AS invalid
            FROM mailing_entries
            WHERE mailing_id = $1
            "#,
        )
        .bind(mailing_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count mailing entries by status")?;

        Ok(StatusCounts {
            pending: row.try_get("pending").unwrap_or(0),
            sending: row.try_get("sending").unwrap_or(0),
            sent: row.try_get("sent").unwrap_or(0),
            failed: row.try_get("failed").unwrap_or(0),
            invalid: row.try_get("invalid").unwrap_or(0),
        })
    }

    async fn reset_stale_sending(&self, stale_threshold: Duration) -> MailerResult<u64> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid stale threshold: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE mailing_entries
            SET status = 'PENDING', updated_at = NOW()
            WHERE status = 'SENDING' AND last_attempt < $1
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("failed to reset stale sending entries")?;

        Ok(result.rows_affected())
    }

    async fn count_stale_sending(&self, stale_threshold: Duration) -> MailerResult<u64> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid stale threshold: {e}")))?;

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS count FROM mailing_entries WHERE status = 'SENDING' AND last_attempt < $1"#,
        )
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await
        .context("failed to count stale sending entries")?;

        let count: i64 = row.try_get("count").context("failed to read stale sending count")?;
        Ok(count.max(0) as u64)
    }
}
