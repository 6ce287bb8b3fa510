//! # Transactional Outbox for mailing dispatch
//!
//! Bridges the atomic database write performed at job intake to the
//! best-effort, at-least-once publish onto the broker. A `Mailing` and
//! its `OutboxMessage` are committed together in one transaction; this
//! processor is the thing that makes the best-effort bridge from that
//! committed row to the broker, with bounded retries and a terminal
//! audit table for rows that never make it across.
//!
//! ## Usage
//!
//! ### 1. Insert the mailing and its outbox row in the same transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxMessage, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//! use chrono::Utc;
//!
//! async fn create_mailing(
//!     pool: &PgPool,
//!     outbox_repo: &SqlxOutboxRepository,
//!     mailing_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     sqlx::query!("INSERT INTO mailings (id, status) VALUES ($1, 'PENDING')", mailing_id)
//!         .execute(&mut *tx)
//!         .await?;
//!
//!     let message = OutboxMessage {
//!         id: Uuid::new_v4(),
//!         mailing_id,
//!         target_queue: "mailing.jobs.process".to_string(),
//!         payload: serde_json::json!({ "mailingId": mailing_id, "attempt": 0 }),
//!         attempts: 0,
//!         published: false,
//!         published_at: None,
//!         last_error: None,
//!         created_at: Utc::now(),
//!     };
//!
//!     outbox_repo.insert(&mut tx, &message).await?;
//!
//!     tx.commit().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Run the background publisher
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxProcessor, SqlxOutboxRepository, OutboxPublisher, OutboxMessage, OutboxResult};
//! use async_trait::async_trait;
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct NoopPublisher;
//!
//! #[async_trait]
//! impl OutboxPublisher for NoopPublisher {
//!     async fn publish(&self, _message: &OutboxMessage) -> OutboxResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/mailer").await?;
//!
//!     let repository = Arc::new(SqlxOutboxRepository::new(pool));
//!     let publisher = Arc::new(NoopPublisher);
//!
//!     let processor = OutboxProcessor::new(
//!         repository,
//!         publisher,
//!         10,                       // batch_size
//!         Duration::from_secs(5),   // poll_interval
//!         5,                        // max_attempts
//!     );
//!
//!     processor.start().await?;
//!
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// A durable publication intent, written in the same transaction as the
/// `Mailing` it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique identifier for this outbox row
    pub id: Uuid,

    /// Owning mailing
    pub mailing_id: Uuid,

    /// Broker routing key this message will be published under
    pub target_queue: String,

    /// Structured payload: mailingId, filename, storage pointer, attempt, createdAt
    pub payload: serde_json::Value,

    /// Number of failed publish attempts
    pub attempts: i32,

    /// Whether this message has reached the broker and been confirmed
    pub published: bool,

    /// Timestamp of the confirmed publish
    pub published_at: Option<DateTime<Utc>>,

    /// Last publish failure, if any
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Audit row for an outbox message that exhausted its publish attempts
/// before ever reaching the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxDeadLetter {
    pub id: Uuid,
    pub original_message_id: Uuid,
    pub mailing_id: Uuid,
    pub target_queue: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub moved_at: DateTime<Utc>,
}

/// Repository trait for managing outbox messages in the database.
///
/// Abstracting this behind a trait keeps `OutboxProcessor` testable
/// against an in-memory fake and lets the worker consumer share the
/// same repository abstraction as the publisher.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new outbox message within a transaction. Must be called
    /// in the same transaction as the owning `Mailing` insert.
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()>;

    /// Oldest unpublished rows, ordered by creation time.
    async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxMessage>>;

    /// Mark a row as published (broker confirm received).
    async fn mark_published(&self, message_id: Uuid) -> OutboxResult<()>;

    /// Record a failed publish attempt; increments `attempts`.
    async fn mark_failed(&self, message_id: Uuid, error: &str) -> OutboxResult<()>;

    /// Copy the row to the audit DLQ table and delete it from the
    /// outbox, in one transaction. Used when `attempts >= max_attempts`.
    async fn move_to_dead_letter(&self, message_id: Uuid) -> OutboxResult<()>;

    /// Pending count and oldest pending age (seconds); age=0 if none pending.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of `OutboxRepository` against Postgres.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return pending count and oldest pending age (seconds). If no pending, age = 0.
    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT AS age_seconds
            FROM outbox_messages
            WHERE published = FALSE
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute outbox pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }

    /// Replay messages created since the given timestamp by resetting
    /// `published`/`attempts`/`last_error`. Operational backfill tool,
    /// not used in the normal publish path.
    pub async fn replay_since(&self, ts: DateTime<Utc>) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET published = FALSE,
                published_at = NULL,
                attempts = 0,
                last_error = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("Failed to replay outbox messages since timestamp")?;

        Ok(res.rows_affected())
    }

    /// Replay messages by id range (inclusive).
    pub async fn replay_range(&self, from_id: Uuid, to_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET published = FALSE,
                published_at = NULL,
                attempts = 0,
                last_error = NULL
            WHERE id BETWEEN $1 AND $2
            "#,
        )
        .bind(from_id)
        .bind(to_id)
        .execute(&self.pool)
        .await
        .context("Failed to replay outbox messages by id range")?;

        Ok(res.rows_affected())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (
                id,
                mailing_id,
                target_queue,
                payload,
                attempts,
                published,
                published_at,
                last_error,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(message.id)
        .bind(message.mailing_id)
        .bind(&message.target_queue)
        .bind(&message.payload)
        .bind(message.attempts)
        .bind(message.published)
        .bind(message.published_at)
        .bind(&message.last_error)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert outbox message")?;

        debug!(
            outbox_id = %message.id,
            mailing_id = %message.mailing_id,
            "outbox message inserted"
        );

        Ok(())
    }

    async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                mailing_id,
                target_queue,
                payload,
                attempts,
                published,
                published_at,
                last_error,
                created_at
            FROM outbox_messages
            WHERE published = FALSE
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unpublished outbox messages")?;

        let messages: Vec<OutboxMessage> = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxMessage {
                    id: row.try_get("id")?,
                    mailing_id: row.try_get("mailing_id")?,
                    target_queue: row.try_get("target_queue")?,
                    payload: row.try_get("payload")?,
                    attempts: row.try_get("attempts")?,
                    published: row.try_get("published")?,
                    published_at: row.try_get("published_at")?,
                    last_error: row.try_get("last_error")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse outbox messages")?;

        debug!(count = messages.len(), "fetched unpublished outbox messages");

        Ok(messages)
    }

    async fn mark_published(&self, message_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET published = TRUE,
                published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox message as published")?;

        if result.rows_affected() == 0 {
            warn!(outbox_id = %message_id, "outbox message not found when marking published");
            return Err(OutboxError::MessageNotFound(message_id));
        }

        debug!(outbox_id = %message_id, "outbox message published");

        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempts = attempts + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark outbox message as failed")?;

        if result.rows_affected() == 0 {
            warn!(outbox_id = %message_id, "outbox message not found when marking failed");
            return Err(OutboxError::MessageNotFound(message_id));
        }

        warn!(outbox_id = %message_id, error = %error, "outbox publish attempt failed");

        Ok(())
    }

    async fn move_to_dead_letter(&self, message_id: Uuid) -> OutboxResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start transaction for outbox dead-letter move")?;

        let row = sqlx::query(
            r#"
            SELECT id, mailing_id, target_queue, payload, attempts, last_error
            FROM outbox_messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to load outbox message for dead-letter move")?
        .ok_or(OutboxError::MessageNotFound(message_id))?;

        sqlx::query(
            r#"
            INSERT INTO outbox_dead_letters (
                id, original_message_id, mailing_id, target_queue, payload, attempts, last_error, moved_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.try_get::<Uuid, _>("id")?)
        .bind(row.try_get::<Uuid, _>("mailing_id")?)
        .bind(row.try_get::<String, _>("target_queue")?)
        .bind(row.try_get::<serde_json::Value, _>("payload")?)
        .bind(row.try_get::<i32, _>("attempts")?)
        .bind(row.try_get::<Option<String>, _>("last_error")?)
        .execute(&mut *tx)
        .await
        .context("Failed to insert outbox dead letter")?;

        sqlx::query("DELETE FROM outbox_messages WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete dead-lettered outbox message")?;

        tx.commit()
            .await
            .context("Failed to commit outbox dead-letter move")?;

        warn!(outbox_id = %message_id, "outbox message moved to dead letter after exhausting publish attempts");

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        SqlxOutboxRepository::pending_stats(self).await
    }
}

/// Publisher trait for delivering outbox messages to the broker.
///
/// Deliberately broker-agnostic: the concrete AMQP implementation lives
/// in the service crate, which also owns the Worker Consumer's broker
/// connection and needs to share its reconnect/channel state.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    /// Publish a message, waiting for the broker's confirm before
    /// returning `Ok`. Implementations must not return `Ok` on a nack.
    async fn publish(&self, message: &OutboxMessage) -> OutboxResult<()>;
}

/// Background processor that bridges committed outbox rows onto the broker.
///
/// - At-least-once delivery: a crash between broker confirm and the
///   `mark_published` UPDATE can cause a duplicate publish; downstream
///   idempotency (the worker's compare-and-set lock) absorbs it.
/// - Bounded retries: rows that exceed `max_attempts` are moved to the
///   outbox dead-letter table rather than retried forever.
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i32,
    poll_interval: Duration,
    max_attempts: i32,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i32,
        poll_interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_attempts,
            metrics: None,
        }
    }

    /// Create a processor that also updates Prometheus metrics each polling cycle.
    pub fn new_with_metrics(
        repository: Arc<R>,
        publisher: Arc<P>,
        metrics: crate::metrics::OutboxMetrics,
        batch_size: i32,
        poll_interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_attempts,
            metrics: Some(metrics),
        }
    }

    /// Run the poll loop indefinitely. Intended to be spawned as a
    /// background task and stopped by aborting its `JoinHandle` during
    /// shutdown (the publisher has no in-flight state worth draining:
    /// a message not yet confirmed is retried on the next tick).
    pub async fn start(&self) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_attempts = self.max_attempts,
            "outbox publisher starting"
        );

        loop {
            match self.process_batch().await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "published outbox messages");
                    } else {
                        debug!("no outbox messages to publish");
                    }
                }
                Err(e) => {
                    error!(error = ?e, "outbox publisher error");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Process one tick: fetch the oldest unpublished batch and, in
    /// order, either dead-letter or publish-and-confirm each row.
    async fn process_batch(&self) -> OutboxResult<i32> {
        let messages = self.repository.get_unpublished(self.batch_size).await?;
        let mut published_count = 0;

        for message in messages {
            if message.attempts >= self.max_attempts {
                if let Err(e) = self.repository.move_to_dead_letter(message.id).await {
                    error!(outbox_id = %message.id, error = ?e, "failed to move outbox message to dead letter");
                } else if let Some(metrics) = &self.metrics {
                    metrics.dead_lettered.inc();
                }
                continue;
            }

            match self.publisher.publish(&message).await {
                Ok(()) => {
                    if let Err(e) = self.repository.mark_published(message.id).await {
                        error!(
                            outbox_id = %message.id,
                            error = ?e,
                            "failed to mark outbox message published after broker confirm"
                        );
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        outbox_id = %message.id,
                        mailing_id = %message.mailing_id,
                        attempts = message.attempts,
                        error = ?e,
                        "failed to publish outbox message"
                    );

                    if let Err(mark_err) =
                        self.repository.mark_failed(message.id, &e.to_string()).await
                    {
                        error!(outbox_id = %message.id, error = ?mark_err, "failed to record outbox publish failure");
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.failed.inc();
                    }
                }
            }
        }

        Ok(published_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRepo {
        messages: Mutex<Vec<OutboxMessage>>,
        dead_lettered: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl OutboxRepository for FakeRepo {
        async fn insert(
            &self,
            _tx: &mut Transaction<'_, Postgres>,
            _message: &OutboxMessage,
        ) -> OutboxResult<()> {
            unimplemented!("not exercised by these tests")
        }

        async fn get_unpublished(&self, limit: i32) -> OutboxResult<Vec<OutboxMessage>> {
            let messages = self.messages.lock().unwrap();
            Ok(messages
                .iter()
                .filter(|m| !m.published)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn mark_published(&self, message_id: Uuid) -> OutboxResult<()> {
            let mut messages = self.messages.lock().unwrap();
            let m = messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or(OutboxError::MessageNotFound(message_id))?;
            m.published = true;
            m.published_at = Some(Utc::now());
            Ok(())
        }

        async fn mark_failed(&self, message_id: Uuid, error: &str) -> OutboxResult<()> {
            let mut messages = self.messages.lock().unwrap();
            let m = messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or(OutboxError::MessageNotFound(message_id))?;
            m.attempts += 1;
            m.last_error = Some(error.to_string());
            Ok(())
        }

        async fn move_to_dead_letter(&self, message_id: Uuid) -> OutboxResult<()> {
            let mut messages = self.messages.lock().unwrap();
            let idx = messages
                .iter()
                .position(|m| m.id == message_id)
                .ok_or(OutboxError::MessageNotFound(message_id))?;
            messages.remove(idx);
            self.dead_lettered.lock().unwrap().push(message_id);
            Ok(())
        }

        async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
            let messages = self.messages.lock().unwrap();
            let pending = messages.iter().filter(|m| !m.published).count() as i64;
            Ok((pending, 0))
        }
    }

    struct AlwaysFailsPublisher;

    #[async_trait]
    impl OutboxPublisher for AlwaysFailsPublisher {
        async fn publish(&self, _message: &OutboxMessage) -> OutboxResult<()> {
            Err(OutboxError::PublishFailed("broker unreachable".to_string()))
        }
    }

    struct AlwaysSucceedsPublisher;

    #[async_trait]
    impl OutboxPublisher for AlwaysSucceedsPublisher {
        async fn publish(&self, _message: &OutboxMessage) -> OutboxResult<()> {
            Ok(())
        }
    }

    fn sample_message(attempts: i32) -> OutboxMessage {
        OutboxMessage {
            id: Uuid::new_v4(),
            mailing_id: Uuid::new_v4(),
            target_queue: "mailing.jobs.process".to_string(),
            payload: serde_json::json!({"mailingId": "x"}),
            attempts,
            published: false,
            published_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publishes_and_marks_confirmed_rows() {
        let repo = Arc::new(FakeRepo::default());
        repo.messages.lock().unwrap().push(sample_message(0));
        let processor = OutboxProcessor::new(
            repo.clone(),
            Arc::new(AlwaysSucceedsPublisher),
            10,
            Duration::from_secs(5),
            5,
        );

        let count = processor.process_batch().await.unwrap();
        assert_eq!(count, 1);
        assert!(repo.messages.lock().unwrap()[0].published);
    }

    #[tokio::test]
    async fn exhausted_attempts_move_to_dead_letter_instead_of_retrying() {
        let repo = Arc::new(FakeRepo::default());
        repo.messages.lock().unwrap().push(sample_message(5));
        let processor = OutboxProcessor::new(
            repo.clone(),
            Arc::new(AlwaysFailsPublisher),
            10,
            Duration::from_secs(5),
            5,
        );

        let count = processor.process_batch().await.unwrap();
        assert_eq!(count, 0);
        assert!(repo.messages.lock().unwrap().is_empty());
        assert_eq!(repo.dead_lettered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_increments_attempts_without_dead_lettering() {
        let repo = Arc::new(FakeRepo::default());
        repo.messages.lock().unwrap().push(sample_message(0));
        let processor = OutboxProcessor::new(
            repo.clone(),
            Arc::new(AlwaysFailsPublisher),
            10,
            Duration::from_secs(5),
            5,
        );

        processor.process_batch().await.unwrap();
        let messages = repo.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attempts, 1);
        assert!(messages[0].last_error.is_some());
    }
}
