use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit row for a terminal failure. Job-level rows carry `email = None`;
/// row-level rows carry the recipient address. A nullable `email` column
/// keeps the two shapes in one table without conflating a job-level
/// identifier (filename) with a recipient address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub mailing_id: Uuid,
    pub email: Option<String>,
    pub reason: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
