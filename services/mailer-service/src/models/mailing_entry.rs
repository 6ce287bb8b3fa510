use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-recipient processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailingEntryStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Invalid,
}

impl MailingEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Invalid => "INVALID",
        }
    }
}

impl std::fmt::Display for MailingEntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MailingEntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENDING" => Ok(Self::Sending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            "INVALID" => Ok(Self::Invalid),
            other => Err(format!("unrecognized mailing entry status: {other}")),
        }
    }
}

/// A single recipient row, tracked by `(mailing_id, email)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingEntry {
    pub id: Uuid,
    pub mailing_id: Uuid,
    pub email: String,
    pub verification_token: String,
    pub status: MailingEntryStatus,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub invalid_reason: Option<String>,
    pub validation_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
