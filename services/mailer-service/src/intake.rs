//! Job Intake & Outbox Writer (§4.1). The storage write happens before
//! the database transaction opens; on rollback the storage object is
//! simply left behind, which is harmless because intake is idempotent
//! on retry (filename is unique).

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use transactional_outbox::{OutboxMessage, OutboxRepository};
use uuid::Uuid;

use error_types::{ErrorContext, MailerError, MailerResult};

use crate::broker::topology::QUEUE_MAIN;
use crate::db::mailing_repository::NewMailing;
use crate::db::MailingRepository;
use crate::storage::MailingStorage;

#[derive(Debug, Clone, serde::Serialize)]
pub struct IntakeResult {
    pub mailing_id: Uuid,
    pub outbox_message_id: Uuid,
}

pub struct JobIntake<O: OutboxRepository> {
    pool: PgPool,
    mailings: Arc<dyn MailingRepository>,
    outbox: Arc<O>,
    storage: Arc<dyn MailingStorage>,
}

impl<O: OutboxRepository> JobIntake<O> {
    pub fn new(
        pool: PgPool,
        mailings: Arc<dyn MailingRepository>,
        outbox: Arc<O>,
        storage: Arc<dyn MailingStorage>,
    ) -> Self {
        Self { pool, mailings, outbox, storage }
    }

    /// Accept a new mailing: reject duplicate filenames, persist the
    /// CSV bytes, then insert the Mailing and its OutboxMessage in one
    /// transaction so the job and the intent to publish it commit or
    /// roll back together.
    pub async fn submit(&self, filename: &str, csv_bytes: &[u8]) -> MailerResult<IntakeResult> {
        if self.mailings.find_by_filename(filename).await?.is_some() {
            return Err(MailerError::DuplicateJob { filename: filename.to_string() });
        }

        let mailing_id = Uuid::new_v4();
        let storage_pointer = self.storage.save(mailing_id, filename, csv_bytes).await?;

        let mut tx = self.pool.begin().await.context("failed to open intake transaction")?;

        let mailing = self
            .mailings
            .insert(
                &mut tx,
                NewMailing { id: mailing_id, filename: filename.to_string(), storage_pointer: storage_pointer.clone() },
            )
            .await?;

        let outbox_message_id = Uuid::new_v4();
        let message = OutboxMessage {
            id: outbox_message_id,
            mailing_id: mailing.id,
            target_queue: QUEUE_MAIN.to_string(),
            payload: json!({
                "kind": "main",
                "mailingId": mailing.id,
                "filename": filename,
                "storageUrl": storage_pointer,
                "attempt": 0,
                "createdAt": Utc::now(),
            }),
            attempts: 0,
            published: false,
            published_at: None,
            last_error: None,
            created_at: Utc::now(),
        };

        self.outbox
            .insert(&mut tx, &message)
            .await
            .map_err(|e| MailerError::internal(anyhow::anyhow!("failed to insert outbox message: {e}")))?;

        tx.commit().await.context("failed to commit intake transaction")?;

        Ok(IntakeResult { mailing_id: mailing.id, outbox_message_id })
    }
}
