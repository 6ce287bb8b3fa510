//! Pure retry classification and backoff (§4.8). No I/O, no sleeping —
//! the worker realizes the prescribed delay by publishing to the retry
//! queue whose TTL approximates it (§4.3), not by sleeping in-process.

use rand::Rng;
use std::time::Duration;

use error_types::MailerError;

use crate::config::RetryPolicyConfig;

/// Where an observed failure puts us relative to the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 408/429/5xx/network/no-status — worth retrying.
    Retryable,
    /// 400/401/403/404/422 — retrying would never help.
    NonRetryable,
}

/// Classify an HTTP status observed from the email provider. `None`
/// covers network errors and timeouts, which carry no status at all.
pub fn classify_status(status: Option<u16>) -> Classification {
    match status {
        Some(400) | Some(401) | Some(403) | Some(404) | Some(422) => Classification::NonRetryable,
        Some(408) | Some(429) => Classification::Retryable,
        Some(s) if (500..600).contains(&s) => Classification::Retryable,
        Some(_) => Classification::NonRetryable,
        None => Classification::Retryable,
    }
}

/// Classify a job-level failure surfaced to the worker's finalize step
/// (CSV/storage read, or a provider failure that propagated up as the
/// terminal cause) — distinct from [`classify_status`], which only ever
/// sees a bare HTTP status. A permanent CSV schema error (e.g. a
/// missing `email` column) or a permanent provider failure will never
/// succeed no matter how many times the job is redelivered, so both
/// classify as non-retryable regardless of the remaining attempt
/// budget (§4.8: "at minimum the job-level decision must not retry on
/// permanent CSV-read errors distinct from provider failures").
pub fn classify_job_failure(error: &MailerError) -> Classification {
    match error {
        MailerError::InvalidInput { .. } | MailerError::PermanentProviderFailure { .. } => {
            Classification::NonRetryable
        }
        _ => Classification::Retryable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    MoveToDeadLetter,
}

/// Job-level retry vs. DLQ decision (§4.8 Decision). The worker's
/// finalize step (§4.4 Step 7) drives this primarily off the attempt
/// counter, but a classifier veto is honored so a permanent CSV-read
/// error never gets retried just because the attempt budget allows it.
pub fn decide(classification: Classification, attempt: u32, max_retries: u32) -> Decision {
    if classification == Classification::NonRetryable {
        return Decision::MoveToDeadLetter;
    }
    if attempt >= max_retries {
        return Decision::MoveToDeadLetter;
    }
    Decision::Retry
}

/// `delay = min(base * 2^(attempt-1), max) ± jitter%`. `attempt` is
/// 1-based (the first retry is attempt 1). `attempt = 0` collapses to
/// the base delay.
pub fn backoff(config: &RetryPolicyConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base_ms = config.base_delay.as_millis() as f64;
    let max_ms = config.max_delay.as_millis() as f64;
    let raw_ms = (base_ms * 2f64.powi(exponent as i32)).min(max_ms);

    let jitter_fraction = config.jitter_percent / 100.0;
    let jitter_factor = 1.0 + rand::thread_rng().gen_range(-jitter_fraction..=jitter_fraction);
    let jittered_ms = (raw_ms * jitter_factor).max(0.0);

    Duration::from_millis(jittered_ms as u64)
}

/// Upper bound for [`backoff`] at a given attempt, used by tests that
/// only need to assert a ceiling rather than an exact jittered value.
pub fn backoff_ceiling(config: &RetryPolicyConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base_ms = config.base_delay.as_millis() as f64;
    let max_ms = config.max_delay.as_millis() as f64;
    let raw_ms = (base_ms * 2f64.powi(exponent as i32)).min(max_ms);
    let jitter_fraction = config.jitter_percent / 100.0;
    Duration::from_millis((raw_ms * (1.0 + jitter_fraction)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_percent: 20.0,
        }
    }

    #[test]
    fn classifies_client_errors_as_non_retryable() {
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(classify_status(Some(status)), Classification::NonRetryable);
        }
    }

    #[test]
    fn classifies_transient_errors_as_retryable() {
        for status in [408, 429, 500, 502, 503] {
            assert_eq!(classify_status(Some(status)), Classification::Retryable);
        }
        assert_eq!(classify_status(None), Classification::Retryable);
    }

    #[test]
    fn non_retryable_always_moves_to_dead_letter() {
        assert_eq!(decide(Classification::NonRetryable, 0, 3), Decision::MoveToDeadLetter);
    }

    #[test]
    fn exhausted_attempts_move_to_dead_letter_even_if_retryable() {
        assert_eq!(decide(Classification::Retryable, 3, 3), Decision::MoveToDeadLetter);
    }

    #[test]
    fn retryable_under_budget_retries() {
        assert_eq!(decide(Classification::Retryable, 1, 3), Decision::Retry);
    }

    #[test]
    fn backoff_at_high_attempt_is_bounded_by_max_delay_plus_jitter() {
        let cfg = config();
        let ceiling = backoff_ceiling(&cfg, 10);
        assert!(ceiling <= Duration::from_millis(360_000));
        for _ in 0..50 {
            assert!(backoff(&cfg, 10) <= ceiling);
        }
    }

    #[test]
    fn invalid_csv_input_classifies_as_non_retryable() {
        let err = MailerError::InvalidInput { message: "missing email column".into(), source: None };
        assert_eq!(classify_job_failure(&err), Classification::NonRetryable);
    }

    #[test]
    fn permanent_provider_failure_classifies_as_non_retryable() {
        let err = MailerError::PermanentProviderFailure { status: 422, detail: "bad request".into() };
        assert_eq!(classify_job_failure(&err), Classification::NonRetryable);
    }

    #[test]
    fn storage_failure_classifies_as_retryable() {
        let err = MailerError::StorageFailure { detail: "temp file unreadable".into() };
        assert_eq!(classify_job_failure(&err), Classification::Retryable);
    }

    #[test]
    fn non_retryable_job_failure_moves_to_dead_letter_even_under_budget() {
        let classification = classify_job_failure(&MailerError::InvalidInput {
            message: "missing email column".into(),
            source: None,
        });
        assert_eq!(decide(classification, 1, 3), Decision::MoveToDeadLetter);
    }

    #[test]
    fn backoff_grows_geometrically_before_the_cap() {
        let cfg = config();
        // At attempt=1, raw = base = 1000ms; ceiling with jitter should stay near 1200ms.
        assert!(backoff_ceiling(&cfg, 1) <= Duration::from_millis(1_200));
    }
}
