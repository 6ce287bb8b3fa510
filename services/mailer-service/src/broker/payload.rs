//! Broker payload shapes. Modeled as one tagged variant type (§9 Design
//! Notes: "dynamic payloads → tagged payloads") rather than a loose JSON
//! map, so the main/retry/DLQ shapes share one serialization schema that
//! tolerates missing optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MailingJobPayload {
    /// Intake's first publish to the main queue.
    Main(MainPayload),
    /// Republished to a retry queue after a failed attempt.
    Retry(RetryPayload),
    /// Published to the terminal DLQ after retries are exhausted.
    Dlq(DlqPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainPayload {
    pub mailing_id: Uuid,
    pub filename: String,
    pub storage_url: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPayload {
    pub mailing_id: Uuid,
    pub filename: String,
    pub storage_url: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: String,
    pub retried_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqPayload {
    pub mailing_id: Uuid,
    pub filename: String,
    pub storage_url: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: String,
    pub retried_at: DateTime<Utc>,
    pub final_error: String,
    pub moved_to_dlq_at: DateTime<Utc>,
    pub total_attempts: u32,
}

impl MailingJobPayload {
    pub fn mailing_id(&self) -> Uuid {
        match self {
            Self::Main(p) => p.mailing_id,
            Self::Retry(p) => p.mailing_id,
            Self::Dlq(p) => p.mailing_id,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Self::Main(p) => &p.filename,
            Self::Retry(p) => &p.filename,
            Self::Dlq(p) => &p.filename,
        }
    }

    pub fn storage_url(&self) -> &str {
        match self {
            Self::Main(p) => &p.storage_url,
            Self::Retry(p) => &p.storage_url,
            Self::Dlq(p) => &p.storage_url,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            Self::Main(p) => p.attempt,
            Self::Retry(p) => p.attempt,
            Self::Dlq(p) => p.attempt,
        }
    }

    /// Build the re-publish payload for a failed attempt that still has
    /// retries left.
    pub fn into_retry(self, error: impl Into<String>) -> RetryPayload {
        let (mailing_id, filename, storage_url, attempt, created_at) = match self {
            Self::Main(p) => (p.mailing_id, p.filename, p.storage_url, p.attempt, p.created_at),
            Self::Retry(p) => (p.mailing_id, p.filename, p.storage_url, p.attempt, p.created_at),
            Self::Dlq(p) => (p.mailing_id, p.filename, p.storage_url, p.attempt, p.created_at),
        };

        RetryPayload {
            mailing_id,
            filename,
            storage_url,
            attempt: attempt + 1,
            created_at,
            last_error: error.into(),
            retried_at: Utc::now(),
        }
    }

    /// Build the terminal DLQ payload once retries are exhausted.
    pub fn into_dlq(self, final_error: impl Into<String>, total_attempts: u32) -> DlqPayload {
        let final_error = final_error.into();
        match self {
            Self::Main(p) => DlqPayload {
                mailing_id: p.mailing_id,
                filename: p.filename,
                storage_url: p.storage_url,
                attempt: p.attempt,
                created_at: p.created_at,
                last_error: final_error.clone(),
                retried_at: Utc::now(),
                final_error,
                moved_to_dlq_at: Utc::now(),
                total_attempts,
            },
            Self::Retry(p) => DlqPayload {
                mailing_id: p.mailing_id,
                filename: p.filename,
                storage_url: p.storage_url,
                attempt: p.attempt,
                created_at: p.created_at,
                last_error: p.last_error,
                retried_at: p.retried_at,
                final_error,
                moved_to_dlq_at: Utc::now(),
                total_attempts,
            },
            Self::Dlq(p) => DlqPayload { final_error, moved_to_dlq_at: Utc::now(), total_attempts, ..p },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_payload_round_trips_through_json() {
        let payload = MailingJobPayload::Main(MainPayload {
            mailing_id: Uuid::new_v4(),
            filename: "recipients.csv".to_string(),
            storage_url: "abc-recipients.csv".to_string(),
            attempt: 0,
            created_at: Utc::now(),
        });

        let json = serde_json::to_string(&payload).unwrap();
        let decoded: MailingJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.attempt(), 0);
    }

    #[test]
    fn retry_conversion_increments_attempt() {
        let payload = MailingJobPayload::Main(MainPayload {
            mailing_id: Uuid::new_v4(),
            filename: "recipients.csv".to_string(),
            storage_url: "abc-recipients.csv".to_string(),
            attempt: 0,
            created_at: Utc::now(),
        });

        let retry = payload.into_retry("boom");
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.last_error, "boom");
    }
}
