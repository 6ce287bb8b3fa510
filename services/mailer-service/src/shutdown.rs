//! Graceful shutdown orchestration (§4.10). Driven by the process
//! receiving SIGINT/SIGTERM or by an uncaught top-level error; the
//! sequence is the same either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;

use crate::broker::channel::BrokerChannel;
use crate::config::ShutdownConfig;
use crate::rate_limiter::RateLimiter;

/// Process-wide "accepting new work" flag (§4.10 step 1). Intake
/// handlers consult this before admitting a new mailing.
static ACCEPTING_WORK: AtomicBool = AtomicBool::new(true);

pub fn is_accepting_work() -> bool {
    ACCEPTING_WORK.load(Ordering::SeqCst)
}

fn stop_accepting_work() {
    ACCEPTING_WORK.store(false, Ordering::SeqCst);
}

/// Coordinates the seven-step drain described in §4.10. Constructed
/// once at startup with handles to every long-running task.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    rate_limiter: Arc<RateLimiter>,
    broker: Arc<BrokerChannel>,
    db_pool: PgPool,
}

impl ShutdownCoordinator {
    pub fn new(
        config: ShutdownConfig,
        rate_limiter: Arc<RateLimiter>,
        broker: Arc<BrokerChannel>,
        db_pool: PgPool,
    ) -> Self {
        Self { config, rate_limiter, broker, db_pool }
    }

    /// Run the full drain sequence. `consumer_handle` and
    /// `publisher_handle` are aborted (steps 2-3) rather than awaited,
    /// since both are infinite loops with no natural completion; their
    /// in-flight work is protected instead by the idle wait in step 4.
    pub async fn shutdown(&self, consumer_handle: &JoinHandle<()>, publisher_handle: &JoinHandle<()>) {
        tracing::info!("graceful shutdown starting");

        // Step 7: force-exit backstop, armed immediately.
        let force_timeout = self.config.force_shutdown_timeout;
        let forced = tokio::spawn(async move {
            tokio::time::sleep(force_timeout).await;
            tracing::error!("force shutdown timeout elapsed, exiting process");
            std::process::exit(1);
        });

        // Step 1.
        stop_accepting_work();

        // Step 2: cancel the consumer subscription. lapin's Consumer
        // stream has no drain-in-place primitive, so in-flight
        // deliveries are bounded instead by the idle wait below, which
        // blocks on the same rate limiter those deliveries send through.
        consumer_handle.abort();

        // Step 3.
        publisher_handle.abort();

        // Step 4.
        let idle = self.rate_limiter.wait_for_idle();
        if tokio::time::timeout(self.config.shutdown_timeout, idle).await.is_err() {
            tracing::warn!("shutdown timeout elapsed before rate limiter went idle, proceeding anyway");
        }

        // Step 5: checkpoints are written inline by the worker; nothing
        // extra to flush here.

        // Step 6.
        self.db_pool.close().await;
        self.broker.close().await;

        forced.abort();
        tracing::info!("graceful shutdown complete");
    }
}

/// Wait for SIGINT or SIGTERM (unix) / Ctrl-C (all platforms).
pub async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl-C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepting_work_defaults_true_and_flips_once_stopped() {
        // Shared global; only assert monotonic direction to avoid
        // interference from other tests toggling the same flag.
        stop_accepting_work();
        assert!(!is_accepting_work());
    }
}
