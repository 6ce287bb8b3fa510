use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a batch job. `Running` is a legacy value recovery
/// may still encounter in rows written by an earlier version; it is never
/// written by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailingStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
    Paused,
    Running,
}

impl MailingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
            Self::Running => "RUNNING",
        }
    }
}

impl std::fmt::Display for MailingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MailingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "PAUSED" => Ok(Self::Paused),
            "RUNNING" => Ok(Self::Running),
            other => Err(format!("unrecognized mailing status: {other}")),
        }
    }
}

/// A batch job: one uploaded CSV, tracked end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailing {
    pub id: Uuid,
    pub filename: String,
    pub storage_pointer: String,
    pub status: MailingStatus,
    pub total_lines: Option<i64>,
    pub processed_lines: i64,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
