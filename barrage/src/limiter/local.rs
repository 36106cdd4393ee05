//! Per-provider in-process admission control.
//!
//! Bounds two independent things for one provider: how many calls may run
//! simultaneously (`max_concurrent`) and how many may be dispatched per
//! refill interval (the optional token-bucket reservoir). Queued work waits
//! its turn; the scheduled future's own output always passes through
//! untouched.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Token-bucket throughput bound for a provider.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReservoirConfig {
    /// Tokens available at start; also the refill ceiling
    pub capacity: u64,
    /// Tokens added back per refill tick
    pub refresh_amount: u64,
    /// How often the reservoir refills
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Configuration for one provider's local limiter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalLimiterConfig {
    /// Maximum simultaneous in-flight calls (default: 10)
    pub max_concurrent: usize,
    /// Optional token-bucket throughput bound (default: none)
    pub reservoir: Option<ReservoirConfig>,
}

impl Default for LocalLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            reservoir: None,
        }
    }
}

/// Point-in-time counters for a limiter, readable without blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Calls currently executing
    pub running: usize,
    /// Calls waiting for admission
    pub queued: usize,
    /// Calls that have released their slot
    pub done: u64,
}

#[derive(Debug)]
struct AdmissionState {
    max_concurrent: usize,
    running: usize,
    reservoir: Option<u64>,
    reservoir_capacity: u64,
}

/// Admission queue for a single provider.
///
/// Admission decisions are serialized under the interior mutex; the stats
/// counters are mirrored into atomics so they can be read at any time
/// without contending with dispatch. Settings changes apply to units not
/// yet dispatched and never disturb in-flight work.
pub struct LocalLimiter {
    provider: String,
    state: Mutex<AdmissionState>,
    slot_freed: Notify,
    queued: AtomicUsize,
    running: AtomicUsize,
    done: AtomicU64,
    shutdown: CancellationToken,
}

impl LocalLimiter {
    /// Create a limiter. When a reservoir is configured, a background tokio
    /// task refills it every `refresh_interval` until the limiter is
    /// dropped.
    pub fn new(provider: impl Into<String>, config: LocalLimiterConfig) -> Arc<Self> {
        let limiter = Arc::new(Self {
            provider: provider.into(),
            state: Mutex::new(AdmissionState {
                max_concurrent: config.max_concurrent.max(1),
                running: 0,
                reservoir: config.reservoir.map(|r| r.capacity),
                reservoir_capacity: config.reservoir.map(|r| r.capacity).unwrap_or(0),
            }),
            slot_freed: Notify::new(),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            done: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        if let Some(reservoir) = config.reservoir {
            tokio::spawn(refill_loop(
                Arc::downgrade(&limiter),
                reservoir,
                limiter.shutdown.clone(),
            ));
        }

        limiter
    }

    /// Queue `fut` behind this limiter and run it once admitted. Queueing
    /// never alters the outcome, only the timing.
    pub async fn schedule<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        {
            // Leaving the queue, whether by admission or by the caller
            // dropping us while we wait.
            let _waiting = scopeguard::guard((), |_| {
                self.queued.fetch_sub(1, Ordering::SeqCst);
            });

            loop {
                if self.try_admit() {
                    break;
                }
                let notified = self.slot_freed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // A slot may have freed between the failed check and the
                // waiter registering; check again before sleeping.
                if self.try_admit() {
                    break;
                }
                notified.await;
            }
        }

        let _slot = scopeguard::guard((), |_| self.release());
        fut.await
    }

    fn try_admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.running >= state.max_concurrent {
            return false;
        }
        if let Some(level) = state.reservoir.as_mut() {
            if *level == 0 {
                return false;
            }
            *level -= 1;
        }
        state.running += 1;
        drop(state);
        self.running.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        self.slot_freed.notify_waiters();
    }

    fn refill(&self, amount: u64) {
        {
            let mut state = self.state.lock();
            let reservoir_capacity = state.reservoir_capacity;
            if let Some(level) = state.reservoir.as_mut() {
                *level = level.saturating_add(amount).min(reservoir_capacity);
            }
        }
        self.slot_freed.notify_waiters();
    }

    /// Change the concurrency bound. Takes effect for units not yet
    /// dispatched; in-flight work keeps its slot.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        {
            let mut state = self.state.lock();
            state.max_concurrent = max_concurrent.max(1);
        }
        tracing::debug!(provider = %self.provider, max_concurrent, "concurrency bound updated");
        self.slot_freed.notify_waiters();
    }

    /// Set the reservoir level directly, introducing a reservoir on a
    /// limiter that had none.
    pub fn set_reservoir(&self, level: u64) {
        {
            let mut state = self.state.lock();
            state.reservoir = Some(level);
            state.reservoir_capacity = state.reservoir_capacity.max(level);
        }
        tracing::debug!(provider = %self.provider, level, "reservoir updated");
        self.slot_freed.notify_waiters();
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            running: self.running.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl Drop for LocalLimiter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn refill_loop(
    limiter: Weak<LocalLimiter>,
    reservoir: ReservoirConfig,
    shutdown: CancellationToken,
) {
    let period = reservoir.refresh_interval.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(limiter) = limiter.upgrade() else {
            break;
        };
        limiter.refill(reservoir.refresh_amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn concurrency_only(max_concurrent: usize) -> Arc<LocalLimiter> {
        LocalLimiter::new(
            "p",
            LocalLimiterConfig {
                max_concurrent,
                reservoir: None,
            },
        )
    }

    #[tokio::test]
    async fn passes_results_and_errors_through() {
        let limiter = concurrency_only(1);

        let ok: Result<u32, String> = limiter.schedule(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, String> = limiter.schedule(async { Err("nope".to_string()) }).await;
        assert_eq!(err.unwrap_err(), "nope");
    }

    #[tokio::test]
    async fn running_never_exceeds_max_concurrent() {
        let limiter = concurrency_only(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let observer = limiter.clone();
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        high_water.fetch_max(now, Ordering::SeqCst);
                        assert!(observer.stats().running <= 2);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(high_water.load(Ordering::SeqCst) <= 2);
        let stats = limiter.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.done, 8);
    }

    #[tokio::test]
    async fn stats_reflect_queueing() {
        let limiter = concurrency_only(1);

        let blocker = limiter.clone();
        let hold = tokio::spawn(async move {
            blocker
                .schedule(async {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued_task = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.schedule(async { 1 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = limiter.stats();
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 1);

        hold.await.unwrap();
        assert_eq!(queued_task.await.unwrap(), 1);
        assert_eq!(limiter.stats().done, 2);
    }

    #[tokio::test]
    async fn raising_max_concurrent_releases_queued_work() {
        let limiter = concurrency_only(1);

        let slow = limiter.clone();
        tokio::spawn(async move {
            slow.schedule(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.schedule(async { "ran" }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.stats().queued, 1);

        limiter.set_max_concurrent(2);
        let result = tokio::time::timeout(Duration::from_millis(100), queued)
            .await
            .expect("queued work should dispatch after the bound was raised")
            .unwrap();
        assert_eq!(result, "ran");
    }

    #[tokio::test]
    async fn empty_reservoir_blocks_until_refill() {
        let limiter = LocalLimiter::new(
            "p",
            LocalLimiterConfig {
                max_concurrent: 10,
                reservoir: Some(ReservoirConfig {
                    capacity: 1,
                    refresh_amount: 1,
                    refresh_interval: Duration::from_millis(50),
                }),
            },
        );

        // First call drains the single token immediately.
        limiter.schedule(async {}).await;

        let started = tokio::time::Instant::now();
        limiter.schedule(async {}).await;
        assert!(
            started.elapsed() >= Duration::from_millis(40),
            "second call should have waited for a refill tick"
        );
    }

    #[tokio::test]
    async fn refill_is_capped_at_capacity() {
        let limiter = LocalLimiter::new(
            "p",
            LocalLimiterConfig {
                max_concurrent: 10,
                reservoir: Some(ReservoirConfig {
                    capacity: 2,
                    refresh_amount: 5,
                    refresh_interval: Duration::from_millis(50),
                }),
            },
        );

        // Let a few refill ticks pass; the bucket must not exceed capacity,
        // so only two calls can dispatch back-to-back afterwards.
        tokio::time::sleep(Duration::from_millis(120)).await;

        limiter.schedule(async {}).await;
        limiter.schedule(async {}).await;
        let third = tokio::time::timeout(Duration::from_millis(5), limiter.schedule(async {})).await;
        assert!(third.is_err(), "third call should wait for the next refill");
    }

    #[tokio::test]
    async fn set_reservoir_takes_effect_for_queued_work() {
        let limiter = LocalLimiter::new(
            "p",
            LocalLimiterConfig {
                max_concurrent: 10,
                reservoir: Some(ReservoirConfig {
                    capacity: 0,
                    refresh_amount: 0,
                    refresh_interval: Duration::from_secs(3600),
                }),
            },
        );

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.schedule(async { 9 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.stats().queued, 1);

        limiter.set_reservoir(1);
        let result = tokio::time::timeout(Duration::from_millis(100), queued)
            .await
            .expect("queued work should dispatch once tokens exist")
            .unwrap();
        assert_eq!(result, 9);
    }
}
