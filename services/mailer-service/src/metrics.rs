//! Prometheus metrics for the mailer pipeline. Mirrors the convention
//! in `transactional-outbox::metrics`: one struct per component,
//! registered against the process-wide default registry at startup.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use tracing::warn;

fn register<C: prometheus::core::Collector + Clone + 'static>(metric: &C, name: &str) {
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "failed to register metric");
    }
}

#[derive(Clone)]
pub struct TokenManagerMetrics {
    pub renewals: IntCounter,
    pub renewal_failures: IntCounter,
}

impl TokenManagerMetrics {
    pub fn new() -> Self {
        let renewals = IntCounter::with_opts(Opts::new(
            "mailer_token_renewals_total",
            "Total number of bearer token renewals performed",
        ))
        .expect("valid metric opts");
        let renewal_failures = IntCounter::with_opts(Opts::new(
            "mailer_token_renewal_failures_total",
            "Total number of bearer token renewal attempts that failed",
        ))
        .expect("valid metric opts");

        register(&renewals, "mailer_token_renewals_total");
        register(&renewal_failures, "mailer_token_renewal_failures_total");

        Self { renewals, renewal_failures }
    }
}

#[derive(Clone)]
pub struct EmailMetrics {
    pub sent: IntCounter,
    pub failed: IntCounter,
    pub invalid: IntCounterVec,
    pub rate_limited_retries: IntCounter,
}

impl EmailMetrics {
    pub fn new() -> Self {
        let sent = IntCounter::with_opts(Opts::new(
            "mailer_emails_sent_total",
            "Total number of emails successfully dispatched",
        ))
        .expect("valid metric opts");
        let failed = IntCounter::with_opts(Opts::new(
            "mailer_emails_failed_total",
            "Total number of rows that failed after exhausting in-row retries",
        ))
        .expect("valid metric opts");
        let invalid = IntCounterVec::new(
            Opts::new("mailer_rows_invalid_total", "Total number of rows rejected by validation"),
            &["reason"],
        )
        .expect("valid metric opts");
        let rate_limited_retries = IntCounter::with_opts(Opts::new(
            "mailer_provider_429_retries_total",
            "Total number of local 429 retries against the email provider",
        ))
        .expect("valid metric opts");

        register(&sent, "mailer_emails_sent_total");
        register(&failed, "mailer_emails_failed_total");
        register(&invalid, "mailer_rows_invalid_total");
        register(&rate_limited_retries, "mailer_provider_429_retries_total");

        Self { sent, failed, invalid, rate_limited_retries }
    }
}

#[derive(Clone)]
pub struct WorkerMetrics {
    pub jobs_locked: IntCounter,
    pub jobs_lock_conflicts: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_retried: IntCounter,
    pub jobs_dead_lettered: IntCounter,
    pub checkpoints_written: IntCounter,
    pub active_jobs: IntGauge,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let jobs_locked = IntCounter::with_opts(Opts::new(
            "mailer_jobs_locked_total",
            "Total number of successful job ownership locks acquired",
        ))
        .expect("valid metric opts");
        let jobs_lock_conflicts = IntCounter::with_opts(Opts::new(
            "mailer_jobs_lock_conflicts_total",
            "Total number of deliveries where the ownership lock was not acquired",
        ))
        .expect("valid metric opts");
        let jobs_completed = IntCounter::with_opts(Opts::new(
            "mailer_jobs_completed_total",
            "Total number of mailings that reached COMPLETED",
        ))
        .expect("valid metric opts");
        let jobs_retried = IntCounter::with_opts(Opts::new(
            "mailer_jobs_retried_total",
            "Total number of mailings republished to a retry queue",
        ))
        .expect("valid metric opts");
        let jobs_dead_lettered = IntCounter::with_opts(Opts::new(
            "mailer_jobs_dead_lettered_total",
            "Total number of mailings moved to the terminal DLQ",
        ))
        .expect("valid metric opts");
        let checkpoints_written = IntCounter::with_opts(Opts::new(
            "mailer_checkpoints_written_total",
            "Total number of processed_lines checkpoint writes",
        ))
        .expect("valid metric opts");
        let active_jobs = IntGauge::with_opts(Opts::new(
            "mailer_active_jobs",
            "Number of mailings currently being processed by this worker",
        ))
        .expect("valid metric opts");

        for (c, name) in [
            (&jobs_locked, "mailer_jobs_locked_total"),
            (&jobs_lock_conflicts, "mailer_jobs_lock_conflicts_total"),
            (&jobs_completed, "mailer_jobs_completed_total"),
            (&jobs_retried, "mailer_jobs_retried_total"),
            (&jobs_dead_lettered, "mailer_jobs_dead_lettered_total"),
            (&checkpoints_written, "mailer_checkpoints_written_total"),
        ] {
            register(c, name);
        }
        register(&active_jobs, "mailer_active_jobs");

        Self {
            jobs_locked,
            jobs_lock_conflicts,
            jobs_completed,
            jobs_retried,
            jobs_dead_lettered,
            checkpoints_written,
            active_jobs,
        }
    }
}

/// Render the default registry in Prometheus text exposition format.
/// Mounted at `GET /metrics` by the HTTP surface.
pub async fn serve_metrics() -> actix_web::HttpResponse {
    let registry = prometheus::default_registry();
    let metric_families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return actix_web::HttpResponse::InternalServerError().finish();
    }
    actix_web::HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}
