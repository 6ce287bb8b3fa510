//! Process-global send scheduler (§4.5). Enforces a concurrency cap and
//! a minimum inter-launch interval across every outbound email send,
//! regardless of which worker task initiates it.
//!
//! Modeled as an explicit singleton constructed once at startup (§9
//! Design Notes: "global singletons → explicit lifecycle") rather than
//! a lazily-initialized getter — accessing it before [`RateLimiter::init`]
//! returns a typed [`MailerError::Precondition`] instead of panicking.

use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;

use error_types::{MailerError, MailerResult};

static INSTANCE: OnceCell<Arc<RateLimiter>> = OnceCell::new();

/// Scheduling priority; a lower value runs first among callers queued
/// for the same launch slot. Ties break FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(pub i32);

#[derive(PartialEq, Eq)]
struct Ticket {
    priority: Priority,
    sequence: u64,
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert priority so the lowest
        // Priority value (highest urgency) sorts first, then lowest
        // sequence number (earliest arrival) sorts first.
        other.priority.cmp(&self.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Gate {
    pending: BinaryHeap<Ticket>,
    last_launch: Option<Instant>,
}

/// Global scheduler: a concurrency-bounded semaphore plus a priority
/// queue gating the minimum interval between launches.
pub struct RateLimiter {
    concurrency: Semaphore,
    min_interval: std::sync::RwLock<Duration>,
    gate: Mutex<Gate>,
    gate_changed: Notify,
    sequence: AtomicU64,
    inflight: AtomicU64,
    queued: AtomicU64,
    idle_notify: Notify,
}

impl RateLimiter {
    fn new(rate_per_minute: u32, concurrency: usize) -> Self {
        Self {
            concurrency: Semaphore::new(concurrency.max(1)),
            min_interval: std::sync::RwLock::new(Self::derive_min_interval(rate_per_minute)),
            gate: Mutex::new(Gate { pending: BinaryHeap::new(), last_launch: None }),
            gate_changed: Notify::new(),
            sequence: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            idle_notify: Notify::new(),
        }
    }

    fn derive_min_interval(rate_per_minute: u32) -> Duration {
        let rate = rate_per_minute.max(1) as u64;
        Duration::from_millis((60_000u64).div_ceil(rate) + 1_000)
    }

    /// Construct and install the process-wide singleton. Must be called
    /// exactly once at startup, before any [`RateLimiter::global`] call.
    pub fn init(rate_per_minute: u32, concurrency: usize) -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new(rate_per_minute, concurrency));
        let _ = INSTANCE.set(limiter.clone());
        limiter
    }

    /// Fetch the singleton installed by [`RateLimiter::init`].
    pub fn global() -> MailerResult<Arc<RateLimiter>> {
        INSTANCE
            .get()
            .cloned()
            .ok_or_else(|| MailerError::Precondition("rate limiter accessed before init".into()))
    }

    /// Re-derive the minimum launch interval from a new rate. The
    /// concurrency cap is fixed at construction; runtime concurrency
    /// changes would require rebuilding the semaphore and are out of
    /// scope for this process-lifetime singleton.
    pub fn update_rate(&self, rate_per_minute: u32) {
        let mut guard = self.min_interval.write().unwrap();
        *guard = Self::derive_min_interval(rate_per_minute);
    }

    /// Run `f` under the concurrency cap and minimum inter-launch
    /// interval, in priority-then-FIFO order among concurrent callers.
    pub async fn schedule<F, Fut, T>(&self, priority: Priority, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.wait_for_turn(priority).await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let _permit = self.concurrency.acquire().await.expect("semaphore never closed");
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let result = f().await;

        self.inflight.fetch_sub(1, Ordering::SeqCst);
        if self.is_idle() {
            self.idle_notify.notify_waiters();
        }
        result
    }

    /// Block until this ticket is both the head of the priority queue
    /// and the minimum interval since the last launch has elapsed.
    async fn wait_for_turn(&self, priority: Priority) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        {
            let mut gate = self.gate.lock().await;
            gate.pending.push(Ticket { priority, sequence });
        }
        self.gate_changed.notify_waiters();

        loop {
            let wait_until = {
                let mut gate = self.gate.lock().await;
                let is_head = gate.pending.peek().map(|t| t.sequence) == Some(sequence);
                if !is_head {
                    None // not our turn; some other ticket must launch first
                } else {
                    let min_interval = *self.min_interval.read().unwrap();
                    let ready_at = gate.last_launch.map(|last| last + min_interval);
                    match ready_at {
                        Some(at) if at > Instant::now() => Some(at),
                        _ => {
                            gate.pending.pop();
                            gate.last_launch = Some(Instant::now());
                            None
                        }
                    }
                }
            };

            let still_queued = {
                let gate = self.gate.lock().await;
                gate.pending.iter().any(|t| t.sequence == sequence)
            };
            if !still_queued {
                self.gate_changed.notify_waiters();
                return;
            }

            match wait_until {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.gate_changed.notified() => {}
                    }
                }
                None => {
                    self.gate_changed.notified().await;
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0 && self.queued.load(Ordering::SeqCst) == 0
    }

    /// Resolve once no jobs are running or queued. Used by graceful
    /// shutdown's drain step.
    pub async fn wait_for_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            let notified = self.idle_notify.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn serializes_launches_under_a_tight_interval() {
        let limiter = Arc::new(RateLimiter::new(60_000, 1)); // ~1ms min interval
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = limiter.clone();
            let order = order.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(Priority::default(), || async {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        order.lock().await.push(n);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(order.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn higher_priority_launches_before_lower_priority_queued_earlier() {
        let limiter = Arc::new(RateLimiter::new(60, 1)); // ~2s min interval, plenty of room to queue
        let order = Arc::new(Mutex::new(Vec::new()));

        // First caller takes the only immediate slot.
        let first = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.schedule(Priority(0), || async {}).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let low = {
            let limiter = limiter.clone();
            let order = order.clone();
            tokio::spawn(async move {
                limiter
                    .schedule(Priority(10), || async {
                        order.lock().await.push("low");
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let high = {
            let limiter = limiter.clone();
            let order = order.clone();
            tokio::spawn(async move {
                limiter
                    .schedule(Priority(0), || async {
                        order.lock().await.push("high");
                    })
                    .await;
            })
        };

        first.await.unwrap();
        low.await.unwrap();
        high.await.unwrap();

        assert_eq!(*order.lock().await, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn wait_for_idle_resolves_once_queue_and_inflight_drain() {
        let limiter = RateLimiter::new(60_000, 2);
        limiter.schedule(Priority::default(), || async {}).await;
        limiter.wait_for_idle().await;
        assert!(limiter.is_idle());
    }

    #[test]
    fn global_before_init_is_a_precondition_error() {
        match RateLimiter::global() {
            Ok(_) => {}
            Err(MailerError::Precondition(_)) => {}
            Err(other) => panic!("unexpected error variant: {other:?}"),
        }
    }
}
