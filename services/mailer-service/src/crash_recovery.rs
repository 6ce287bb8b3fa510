//! Boot-time recovery (§4.9). Runs once, before the worker consumer
//! starts subscribing, so no in-flight delivery races a stale row it
//! is about to reset.

use std::sync::Arc;
use std::time::Duration;

use error_types::MailerResult;
use serde::Serialize;

use crate::db::{MailingEntryRepository, MailingRepository};

#[derive(Debug, Default, Clone, Serialize)]
pub struct RecoverySummary {
    pub stale_sending_entries_reset: u64,
    pub stale_processing_heartbeats_cleared: u64,
    pub stale_running_mailings_paused: u64,
}

impl RecoverySummary {
    pub fn is_empty(&self) -> bool {
        self.stale_sending_entries_reset == 0
            && self.stale_processing_heartbeats_cleared == 0
            && self.stale_running_mailings_paused == 0
    }
}

pub struct CrashRecovery {
    mailings: Arc<dyn MailingRepository>,
    entries: Arc<dyn MailingEntryRepository>,
    stale_sending_threshold: Duration,
    stale_processing_threshold: Duration,
}

impl CrashRecovery {
    pub fn new(
        mailings: Arc<dyn MailingRepository>,
        entries: Arc<dyn MailingEntryRepository>,
        stale_sending_threshold: Duration,
        stale_processing_threshold: Duration,
    ) -> Self {
        Self { mailings, entries, stale_sending_threshold, stale_processing_threshold }
    }

    /// Steps 1-3: reset stale SENDING entries, clear stale PROCESSING
    /// heartbeats, and pause legacy stale RUNNING mailings. Step 4 is
    /// the summary this returns, which the caller logs.
    pub async fn run(&self) -> MailerResult<RecoverySummary> {
        let stale_sending_entries_reset =
            self.entries.reset_stale_sending(self.stale_sending_threshold).await?;
        let stale_processing_heartbeats_cleared =
            self.mailings.clear_stale_processing_heartbeat(self.stale_processing_threshold).await?;
        let stale_running_mailings_paused = self.mailings.pause_stale_running().await?;

        let summary = RecoverySummary {
            stale_sending_entries_reset,
            stale_processing_heartbeats_cleared,
            stale_running_mailings_paused,
        };

        if summary.is_empty() {
            tracing::info!("crash recovery found nothing to reconcile");
        } else {
            tracing::warn!(
                stale_sending_entries_reset = summary.stale_sending_entries_reset,
                stale_processing_heartbeats_cleared = summary.stale_processing_heartbeats_cleared,
                stale_running_mailings_paused = summary.stale_running_mailings_paused,
                "crash recovery reconciled stale state"
            );
        }

        Ok(summary)
    }

    /// Non-destructive probe: would recovery find stale state right
    /// now? Used by the health endpoint — counts only, no mutation.
    pub async fn check_recovery_needed(&self) -> MailerResult<bool> {
        let stale_sending = self.entries.count_stale_sending(self.stale_sending_threshold).await?;
        let stale_processing =
            self.mailings.count_stale_processing(self.stale_processing_threshold).await?;
        let stale_running = self.mailings.count_stale_running().await?;

        Ok(stale_sending > 0 || stale_processing > 0 || stale_running > 0)
    }
}
