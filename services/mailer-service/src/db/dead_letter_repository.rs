//! Repository over the `dead_letters` audit table.

use async_trait::async_trait;
use error_types::MailerResult;
use error_types::ErrorContext;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::DeadLetter;

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Insert a job-level dead letter (`email = None`) or a row-level one.
    async fn insert(
        &self,
        mailing_id: Uuid,
        email: Option<&str>,
        reason: &str,
        attempts: i32,
        last_error: Option<&str>,
    ) -> MailerResult<DeadLetter>;

    async fn list_for_mailing(&self, mailing_id: Uuid) -> MailerResult<Vec<DeadLetter>>;
}

pub struct SqlxDeadLetterRepository {
    pool: PgPool,
}

impl SqlxDeadLetterRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_dead_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, sqlx::Error> {
        Ok(DeadLetter {
            id: row.try_get("id")?,
            mailing_id: row.try_get("mailing_id")?,
            email: row.try_get("email")?,
            reason: row.try_get("reason")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl DeadLetterRepository for SqlxDeadLetterRepository {
    async fn insert(
        &self,
        mailing_id: Uuid,
        email: Option<&str>,
        reason: &str,
        attempts: i32,
        last_error: Option<&str>,
    ) -> MailerResult<DeadLetter> {
        let row = sqlx::query(
            r#"
            INSERT INTO dead_letters (id, mailing_id, email, reason, attempts, last_error)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(mailing_id)
        .bind(email)
        .bind(reason)
        .bind(attempts)
        .bind(last_error)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert dead letter")?;

        Self::row_to_dead_letter(&row).context("failed to decode dead letter")
    }

    async fn list_for_mailing(&self, mailing_id: Uuid) -> MailerResult<Vec<DeadLetter>> {
        let rows = sqlx::query(r#"SELECT * FROM dead_letters WHERE mailing_id = $1 ORDER BY created_at ASC"#)
            .bind(mailing_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to list dead letters")?;

        rows.iter()
            .map(Self::row_to_dead_letter)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to decode dead letters")
    }
}
