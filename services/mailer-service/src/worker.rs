//! Worker Consumer (§4.4) — the largest component in the pipeline.
//! Implements [`DeliveryHandler`] so the broker plumbing in
//! [`crate::broker::consumer`] can drive it without knowing anything
//! about mailings, CSV parsing, or retry/DLQ bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use encoding_rs::{UTF_8, WINDOWS_1252};
use rand::Rng;
use sha2::{Digest, Sha256};

use error_types::{ErrorContext, MailerError, MailerResult};

use crate::broker::channel::BrokerChannel;
use crate::broker::payload::MailingJobPayload;
use crate::broker::topology::{retry_queue_for_attempt, QUEUE_DLQ};
use crate::broker::{consumer::DeliveryHandler, publish_direct};
use crate::config::WorkerConfig;
use crate::db::{DeadLetterRepository, MailingEntryRepository, MailingRepository};
use crate::email_client::EmailProviderClient;
use crate::metrics::WorkerMetrics;
use crate::retry_policy::{self, Classification, Decision};
use crate::storage::MailingStorage;
use crate::validation;

/// Outcome of processing every row in a mailing's CSV.
struct RowProcessingResult {
    total_lines: i64,
    failed_count: i64,
}

pub struct Worker {
    mailings: Arc<dyn MailingRepository>,
    entries: Arc<dyn MailingEntryRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    storage: Arc<dyn MailingStorage>,
    email_client: Arc<EmailProviderClient>,
    resolver: hickory_resolver::TokioAsyncResolver,
    broker: Arc<BrokerChannel>,
    config: WorkerConfig,
    validation_config: crate::config::ValidationConfig,
    retry_policy_config: crate::config::RetryPolicyConfig,
    metrics: WorkerMetrics,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailings: Arc<dyn MailingRepository>,
        entries: Arc<dyn MailingEntryRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        storage: Arc<dyn MailingStorage>,
        email_client: Arc<EmailProviderClient>,
        broker: Arc<BrokerChannel>,
        config: WorkerConfig,
        validation_config: crate::config::ValidationConfig,
        retry_policy_config: crate::config::RetryPolicyConfig,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            mailings,
            entries,
            dead_letters,
            storage,
            email_client,
            resolver: validation::build_resolver(),
            broker,
            config,
            validation_config,
            retry_policy_config,
            metrics,
        }
    }

    async fn process_delivery(&self, payload: MailingJobPayload) -> MailerResult<()> {
        let mailing_id = payload.mailing_id();
        let attempt = payload.attempt();
        let span = tracing::info_span!("mailing_delivery", mailing_id = %mailing_id, attempt);
        let _enter = span.enter();

        // Step 2: ownership lock.
        let lock = self.mailings.try_acquire_lock(mailing_id, self.config.stale_lock_threshold).await?;
        if !lock.acquired {
            tracing::debug!("lock not acquired, another worker owns this job or it is already terminal");
            return Ok(());
        }
        self.metrics.jobs_locked.inc();
        self.metrics.active_jobs.inc();

        let result = self.run_locked(mailing_id, &payload, lock.attempts).await;
        self.metrics.active_jobs.dec();
        result
    }

    async fn run_locked(
        &self,
        mailing_id: uuid::Uuid,
        payload: &MailingJobPayload,
        attempts: i32,
    ) -> MailerResult<()> {
        // Step 3: fetch CSV.
        let local_path = match self.storage.fetch_to_temp_file(payload.storage_url()).await {
            Ok(path) => path,
            Err(e) => {
                let classification = retry_policy::classify_job_failure(&e);
                return self
                    .finalize(mailing_id, payload, attempts, Err((e.to_string(), classification)))
                    .await;
            }
        };

        // Step 4 + 5: parse, resume, process rows.
        match self.process_rows(mailing_id, &local_path).await {
            Ok(outcome) => {
                let failure_rate = if outcome.total_lines > 0 {
                    outcome.failed_count as f64 / outcome.total_lines as f64
                } else {
                    0.0
                };

                if failure_rate > self.config.failure_threshold {
                    let reason = format!(
                        "failure rate exceeded: {failure_rate:.2} > {:.2}",
                        self.config.failure_threshold
                    );
                    // A high per-row failure rate is a transient signal about
                    // this run, not a permanent defect in the job itself.
                    self.finalize(mailing_id, payload, attempts, Err((reason, Classification::Retryable))).await
                } else {
                    self.finalize(mailing_id, payload, attempts, Ok(())).await
                }
            }
            Err(e) => {
                let classification = retry_policy::classify_job_failure(&e);
                self.finalize(mailing_id, payload, attempts, Err((e.to_string(), classification))).await
            }
        }
    }

    /// Step 4 + 5: decode, parse with resume, validate/send/checkpoint
    /// every row from the mailing's current `processed_lines` cursor.
    async fn process_rows(
        &self,
        mailing_id: uuid::Uuid,
        local_path: &std::path::Path,
    ) -> MailerResult<RowProcessingResult> {
        let mailing = self
            .mailings
            .get(mailing_id)
            .await?
            .ok_or_else(|| MailerError::NotFound { resource: "mailing", id: mailing_id.to_string() })?;

        let bytes = tokio::fs::read(local_path).await.context("failed to read CSV from storage")?;
        let text = decode_csv_bytes(&bytes);

        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(text.as_bytes());
        let headers = reader.headers().context("failed to read CSV header row")?.clone();
        let email_col = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case("email"))
            .ok_or_else(|| MailerError::InvalidInput {
                message: "CSV is missing an `email` column".to_string(),
                source: None,
            })?;

        let records: Vec<csv::StringRecord> =
            reader.records().collect::<Result<Vec<_>, _>>().context("failed to parse CSV rows")?;
        let total_lines = records.len() as i64;

        if mailing.total_lines != Some(total_lines) {
            self.mailings.update_total_lines(mailing_id, total_lines).await?;
        }

        let start_index = mailing.processed_lines.max(0) as usize;
        let mut failed_count: i64 = 0;

        for (offset, record) in records.iter().enumerate().skip(start_index) {
            let email_raw = record.get(email_col).unwrap_or("").trim();

            if email_raw.is_empty() {
                failed_count += 1;
            } else {
                let email = email_raw.to_lowercase();
                if !self.process_row(mailing_id, &email).await {
                    failed_count += 1;
                }
            }

            let index = offset + 1;
            if index % 10 == 0 {
                tokio::task::yield_now().await;
            }
            if index as u64 % self.config.checkpoint_interval == 0 || index == records.len() {
                self.mailings.checkpoint(mailing_id, index as i64).await?;
                self.metrics.checkpoints_written.inc();
            }
        }

        Ok(RowProcessingResult { total_lines, failed_count })
    }

    /// Steps 5b-5d for a single row. Returns `true` on a successful
    /// send, `false` on any row-level failure (invalid or send error).
    async fn process_row(&self, mailing_id: uuid::Uuid, email: &str) -> bool {
        let token = generate_verification_token();

        if let Err(failure) = validation::validate_email(email, &self.validation_config, &self.resolver).await {
            if let Err(e) = self
                .entries
                .mark_invalid(mailing_id, email, &token, failure.reason.code(), failure.details)
                .await
            {
                tracing::error!(error = %e, "failed to record invalid mailing entry");
            }
            return false;
        }

        let idempotency_key = row_idempotency_key(mailing_id, email, &token);

        let entry = match self.entries.upsert_pending(mailing_id, email, &token).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(error = %e, "failed to upsert mailing entry");
                return false;
            }
        };

        if let Err(e) = self.entries.mark_sending(entry.id).await {
            tracing::error!(error = %e, "failed to mark mailing entry sending");
        }

        let subject = "Please verify your email";
        let body = format!("Your verification code is {token}");

        match self.email_client.send_with_local_429_retry(email, subject, &body, &idempotency_key).await {
            Ok(outcome) => {
                if let Err(e) = self.entries.mark_sent(entry.id, &outcome.message_id).await {
                    tracing::error!(error = %e, "failed to mark mailing entry sent");
                }
                true
            }
            Err(e) => {
                let reason: String = e.to_string().chars().take(500).collect();
                if let Err(e) = self.entries.mark_failed(entry.id, &reason).await {
                    tracing::error!(error = %e, "failed to mark mailing entry failed");
                }
                false
            }
        }
    }

    /// Step 7: success clears the job; failure either republishes to
    /// the matching retry queue or moves the job to the terminal DLQ.
    /// The classifier can veto a retry outright (§4.8 Decision) ahead
    /// of the attempt budget — a permanent CSV schema error or a
    /// permanent provider failure is never worth cycling through both
    /// retry queues before landing in the DLQ.
    async fn finalize(
        &self,
        mailing_id: uuid::Uuid,
        payload: &MailingJobPayload,
        attempts: i32,
        outcome: Result<(), (String, Classification)>,
    ) -> MailerResult<()> {
        match outcome {
            Ok(()) => {
                self.mailings.mark_completed(mailing_id).await?;
                self.metrics.jobs_completed.inc();
                Ok(())
            }
            Err((reason, classification)) => {
                let max_retries = self.retry_policy_config.max_retries;
                let current_attempt = payload.attempt();
                let next_attempt = current_attempt + 1;

                match retry_policy::decide(classification, attempts.max(0) as u32, max_retries) {
                    Decision::Retry => {
                        self.mailings.mark_failed(mailing_id, &reason).await?;
                        let retry_payload = MailingJobPayload::Retry(payload.clone().into_retry(reason));
                        let queue = retry_queue_for_attempt(next_attempt);
                        publish_direct(&self.broker, queue, &retry_payload).await?;
                        self.metrics.jobs_retried.inc();
                        Ok(())
                    }
                    Decision::MoveToDeadLetter => {
                        self.dead_letters.insert(mailing_id, None, &reason, attempts, Some(&reason)).await?;
                        self.mailings.mark_failed(mailing_id, &reason).await?;
                        let dlq_payload =
                            MailingJobPayload::Dlq(payload.clone().into_dlq(reason, next_attempt));
                        publish_direct(&self.broker, QUEUE_DLQ, &dlq_payload).await?;
                        self.metrics.jobs_dead_lettered.inc();
                        Ok(())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for Worker {
    async fn handle(&self, payload: MailingJobPayload) -> MailerResult<()> {
        self.process_delivery(payload).await
    }
}

/// Detect encoding from the leading bytes: UTF-8 (with or without a
/// BOM) if it decodes cleanly, Latin-1 (Windows-1252 superset) as the
/// fallback when UTF-8 decoding would introduce replacement characters.
fn decode_csv_bytes(bytes: &[u8]) -> String {
    let (text, _, had_errors) = UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = WINDOWS_1252.decode(bytes);
    text.into_owned()
}

fn generate_verification_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Per-row stable idempotency key: SHA-256 of `mailingId-email-token`.
fn row_idempotency_key(mailing_id: uuid::Uuid, email: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{mailing_id}-{email}-{token}"));
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_utf8() {
        assert_eq!(decode_csv_bytes("email\nuser@example.com\n".as_bytes()), "email\nuser@example.com\n");
    }

    #[test]
    fn falls_back_to_latin1_on_invalid_utf8() {
        let bytes = [b'a', 0xe9, b'b']; // 0xe9 is invalid as a UTF-8 continuation here
        let decoded = decode_csv_bytes(&bytes);
        assert!(decoded.contains('a') && decoded.contains('b'));
    }

    #[test]
    fn idempotency_key_is_stable_for_the_same_inputs() {
        let id = uuid::Uuid::new_v4();
        let a = row_idempotency_key(id, "user@example.com", "tok123");
        let b = row_idempotency_key(id, "user@example.com", "tok123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn idempotency_key_changes_with_token() {
        let id = uuid::Uuid::new_v4();
        let a = row_idempotency_key(id, "user@example.com", "tok123");
        let b = row_idempotency_key(id, "user@example.com", "tok456");
        assert_ne!(a, b);
    }

    #[test]
    fn verification_tokens_are_32_hex_chars() {
        let token = generate_verification_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
