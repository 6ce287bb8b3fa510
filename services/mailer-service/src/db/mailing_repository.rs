//! Repository over the `mailings` table. The worker consumer and crash
//! recovery talk to the database exclusively through this trait — never
//! through a raw `PgPool` handle — so ownership locking stays a single
//! auditable SQL statement wherever it is exercised.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use error_types::{ErrorContext, MailerError, MailerResult};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{Mailing, MailingStatus};

/// Fields supplied at intake; the row's id, status, and timestamps are
/// assigned by the repository.
pub struct NewMailing {
    pub id: Uuid,
    pub filename: String,
    pub storage_pointer: String,
}

/// Result of the Step 2 compare-and-set ownership lock.
#[derive(Debug, Clone, Copy)]
pub struct LockOutcome {
    /// `true` when this call's UPDATE affected exactly one row.
    pub acquired: bool,
    /// The Mailing's attempt counter *after* the increment, valid only
    /// when `acquired` is true.
    pub attempts: i32,
}

#[async_trait]
pub trait MailingRepository: Send + Sync {
    async fn find_by_filename(&self, filename: &str) -> MailerResult<Option<Mailing>>;

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: NewMailing,
    ) -> MailerResult<Mailing>;

    async fn get(&self, id: Uuid) -> MailerResult<Option<Mailing>>;

    /// The Step 2 ownership lock: one conditional UPDATE, eligibility
    /// predicate evaluated by the database itself under snapshot
    /// isolation, never split into a SELECT followed by an UPDATE.
    async fn try_acquire_lock(
        &self,
        id: Uuid,
        stale_lock_threshold: Duration,
    ) -> MailerResult<LockOutcome>;

    async fn update_total_lines(&self, id: Uuid, total_lines: i64) -> MailerResult<()>;

    async fn checkpoint(&self, id: Uuid, processed_lines: i64) -> MailerResult<()>;

    async fn mark_completed(&self, id: Uuid) -> MailerResult<()>;

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> MailerResult<()>;

    /// Crash recovery step 2: stale PROCESSING rows get their heartbeat
    /// cleared so the next redelivery can re-acquire the lock via the
    /// staleness branch. Returns the number of rows touched.
    async fn clear_stale_processing_heartbeat(&self, stale_threshold: Duration) -> MailerResult<u64>;

    /// Crash recovery step 3: legacy RUNNING rows move to PAUSED.
    async fn pause_stale_running(&self) -> MailerResult<u64>;

    /// Non-destructive counterpart to [`MailingRepository::clear_stale_processing_heartbeat`].
    async fn count_stale_processing(&self, stale_threshold: Duration) -> MailerResult<u64>;

    /// Non-destructive counterpart to [`MailingRepository::pause_stale_running`].
    async fn count_stale_running(&self) -> MailerResult<u64>;
}

pub struct SqlxMailingRepository {
    pool: PgPool,
}

impl SqlxMailingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_mailing(row: &sqlx::postgres::PgRow) -> Result<Mailing, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = status_str.parse::<MailingStatus>().map_err(|e| {
            sqlx::Error::ColumnDecode { index: "status".to_string(), source: e.into() }
        })?;

        Ok(Mailing {
            id: row.try_get("id")?,
            filename: row.try_get("filename")?,
            storage_pointer: row.try_get("storage_pointer")?,
            status,
            total_lines: row.try_get("total_lines")?,
            processed_lines: row.try_get("processed_lines")?,
            attempts: row.try_get("attempts")?,
            last_attempt: row.try_get("last_attempt")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl MailingRepository for SqlxMailingRepository {
    async fn find_by_filename(&self, filename: &str) -> MailerResult<Option<Mailing>> {
        let row = sqlx::query(
            r#"SELECT * FROM mailings WHERE filename = $1"#,
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up mailing by filename")?;

        row.as_ref().map(Self::row_to_mailing).transpose().context("failed to decode mailing row")
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: NewMailing,
    ) -> MailerResult<Mailing> {
        let row = sqlx::query(
            r#"
            INSERT INTO mailings (id, filename, storage_pointer, status, processed_lines, attempts)
            VALUES ($1, $2, $3, 'PENDING', 0, 0)
            RETURNING *
            "#,
        )
        .bind(new.id)
        .bind(&new.filename)
        .bind(&new.storage_pointer)
        .fetch_one(&mut **tx)
        .await
        .context("failed to insert mailing")?;

        Self::row_to_mailing(&row).context("failed to decode inserted mailing")
    }

    async fn get(&self, id: Uuid) -> MailerResult<Option<Mailing>> {
        let row = sqlx::query(r#"SELECT * FROM mailings WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load mailing")?;

        row.as_ref().map(Self::row_to_mailing).transpose().context("failed to decode mailing row")
    }

    async fn try_acquire_lock(
        &self,
        id: Uuid,
        stale_lock_threshold: Duration,
    ) -> MailerResult<LockOutcome> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_lock_threshold)
            .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid stale lock threshold: {e}")))?;

        let row = sqlx::query(
            r#"
            UPDATE mailings
            SET status = 'PROCESSING',
                attempts = attempts + 1,
                last_attempt = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND (
                status IN ('PENDING', 'QUEUED', 'FAILED')
                OR (status = 'PROCESSING' AND (last_attempt IS NULL OR last_attempt < $2))
              )
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .context("failed to execute ownership lock update")?;

        match row {
            Some(row) => {
                let attempts: i32 = row.try_get("attempts").context("failed to read attempts")?;
                Ok(LockOutcome { acquired: true, attempts })
            }
            None => Ok(LockOutcome { acquired: false, attempts: 0 }),
        }
    }

    async fn update_total_lines(&self, id: Uuid, total_lines: i64) -> MailerResult<()> {
        sqlx::query(
            r#"UPDATE mailings SET total_lines = $2, updated_at = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .bind(total_lines)
        .execute(&self.pool)
        .await
        .context("failed to update total_lines")?;

        Ok(())
    }

    async fn checkpoint(&self, id: Uuid, processed_lines: i64) -> MailerResult<()> {
        sqlx::query(
            r#"UPDATE mailings SET processed_lines = $2, updated_at = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .bind(processed_lines)
        .execute(&self.pool)
        .await
        .context("failed to checkpoint processed_lines")?;

        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> MailerResult<()> {
        sqlx::query(
            r#"
            UPDATE mailings
            SET status = 'COMPLETED', last_attempt = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark mailing completed")?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> MailerResult<()> {
        sqlx::query(
            r#"
            UPDATE mailings
            SET status = 'FAILED', last_attempt = NOW(), error_message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("failed to mark mailing failed")?;

        Ok(())
    }

    async fn clear_stale_processing_heartbeat(&self, stale_threshold: Duration) -> MailerResult<u64> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid stale threshold: {e}")))?;

        let result = sqlx::query(
            r#"
            UPDATE mailings
            SET last_attempt = NULL, updated_at = NOW()
            WHERE status = 'PROCESSING' AND updated_at < $1
            "#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .context("failed to clear stale processing heartbeats")?;

        Ok(result.rows_affected())
    }

    async fn pause_stale_running(&self) -> MailerResult<u64> {
        let result = sqlx::query(
            r#"UPDATE mailings SET status = 'PAUSED', updated_at = NOW() WHERE status = 'RUNNING'"#,
        )
        .execute(&self.pool)
        .await
        .context("failed to pause stale running mailings")?;

        Ok(result.rows_affected())
    }

    async fn count_stale_processing(&self, stale_threshold: Duration) -> MailerResult<u64> {
        let stale_before = Utc::now() - chrono::Duration::from_std(stale_threshold)
            .map_err(|e| MailerError::internal(anyhow::anyhow!("invalid stale threshold: {e}")))?;

        let row = sqlx::query(
            r#"SELECT COUNT(*) AS count FROM mailings WHERE status = 'PROCESSING' AND updated_at < $1"#,
        )
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await
        .context("failed to count stale processing mailings")?;

        let count: i64 = row.try_get("count").context("failed to read stale processing count")?;
        Ok(count.max(0) as u64)
    }

    async fn count_stale_running(&self) -> MailerResult<u64> {
        let row = sqlx::query(r#"SELECT COUNT(*) AS count FROM mailings WHERE status = 'RUNNING'"#)
            .fetch_one(&self.pool)
            .await
            .context("failed to count stale running mailings")?;

        let count: i64 = row.try_get("count").context("failed to read stale running count")?;
        Ok(count.max(0) as u64)
    }
}
