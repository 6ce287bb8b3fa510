//! Process-wide shared state (§9 "explicit lifecycle" design note).
//! Constructed once in `main` and handed to every HTTP handler and
//! background task as `web::Data<AppState>`; nothing here is a
//! getter-style singleton — collaborators that *are* singletons
//! (rate limiter, token manager) are still passed in explicitly.

use std::sync::Arc;

use sqlx::PgPool;

use crate::broker::channel::BrokerChannel;
use crate::crash_recovery::CrashRecovery;
use crate::db::{DeadLetterRepository, MailingEntryRepository, MailingRepository};
use crate::intake::JobIntake;
use crate::storage::MailingStorage;
use transactional_outbox::SqlxOutboxRepository;

pub struct AppState {
    pub pool: PgPool,
    pub mailings: Arc<dyn MailingRepository>,
    pub entries: Arc<dyn MailingEntryRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub storage: Arc<dyn MailingStorage>,
    pub broker: Arc<BrokerChannel>,
    pub intake: Arc<JobIntake<SqlxOutboxRepository>>,
    pub crash_recovery: Arc<CrashRecovery>,
}
