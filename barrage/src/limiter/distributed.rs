//! Cross-process admission control against a shared provider quota.
//!
//! Every cooperating worker process decrements the same per-provider ledger
//! through a [`CounterStore`] before dispatching a call, so the provider's
//! global budget holds even though the workers never talk to each other.
//! The ledger self-expires and is recreated lazily; the store's atomic
//! consume is the only cross-process critical section in the system.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{BarrageError, Result};

/// Outcome of one consumption attempt against the shared ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    Allowed,
    Denied {
        /// Time until the ledger window resets, when the store knows it.
        retry_after: Option<Duration>,
    },
}

/// Remote atomic counter with expiry, shared by all worker processes.
///
/// Implementations must make `consume` atomic per key: two processes
/// consuming the last point must not both be admitted. A ledger that has
/// expired (or never existed) is recreated with `limit` points and a fresh
/// `ttl` before the decrement is applied.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn consume(
        &self,
        key: &str,
        points: u32,
        limit: u32,
        ttl: Duration,
    ) -> Result<Consumption>;
}

/// Configuration for one provider's share of the global quota.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedLimitConfig {
    /// Points available per rolling window, across all processes
    /// (default: 60)
    pub points: u32,
    /// Length of the rolling window (default: 60s)
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Consumption retries before giving up on admission (default: 5)
    pub max_attempts: u32,
    /// First retry delay after a denial (default: 500ms)
    #[serde(with = "humantime_serde")]
    pub retry_base: Duration,
    /// Multiplier applied to the retry delay after each denial
    /// (default: 2.0)
    pub retry_growth: f64,
    /// Upper bound on the retry delay (default: 10s)
    #[serde(with = "humantime_serde")]
    pub retry_cap: Duration,
}

impl Default for DistributedLimitConfig {
    fn default() -> Self {
        Self {
            points: 60,
            window: Duration::from_secs(60),
            max_attempts: 5,
            retry_base: Duration::from_millis(500),
            retry_growth: 2.0,
            retry_cap: Duration::from_secs(10),
        }
    }
}

/// Admission gate for one provider backed by the shared counter store.
pub struct DistributedLimiter {
    provider: String,
    config: DistributedLimitConfig,
    store: Arc<dyn CounterStore>,
}

impl DistributedLimiter {
    pub fn new(
        provider: impl Into<String>,
        config: DistributedLimitConfig,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            store,
        }
    }

    /// One consumption attempt. Denial is a normal outcome, not an error.
    /// An unreachable store degrades to allowed: the global guarantee is
    /// best-effort, the local limiter's guarantee stays absolute.
    pub async fn try_consume(&self) -> Consumption {
        let attempt = self
            .store
            .consume(
                &self.provider,
                1,
                self.config.points,
                self.config.window,
            )
            .await;
        match attempt {
            Ok(consumption) => consumption,
            Err(error) => {
                tracing::warn!(
                    provider = %self.provider,
                    error = %error,
                    "rate limit store unreachable, falling back to local-only limiting"
                );
                Consumption::Allowed
            }
        }
    }

    /// Admit one call, retrying denials on an exponential schedule with
    /// ±20% jitter. A bounded loop rather than recursion: an adversarial
    /// denial sequence must not grow the stack.
    pub async fn admit(&self) -> Result<()> {
        for attempt in 0..=self.config.max_attempts {
            match self.try_consume().await {
                Consumption::Allowed => {
                    if attempt > 0 {
                        tracing::debug!(
                            provider = %self.provider,
                            attempt,
                            "admitted after rate limit denials"
                        );
                    }
                    return Ok(());
                }
                Consumption::Denied { retry_after } => {
                    if attempt == self.config.max_attempts {
                        break;
                    }
                    let delay = self.retry_delay(attempt);
                    tracing::debug!(
                        provider = %self.provider,
                        attempt,
                        delay = %humantime::format_duration(delay),
                        ledger_resets_in = ?retry_after,
                        "rate limit denied, waiting to retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(BarrageError::RateLimited {
            provider: self.provider.clone(),
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let grown =
            self.config.retry_base.as_secs_f64() * self.config.retry_growth.powi(attempt as i32);
        let capped = grown.min(self.config.retry_cap.as_secs_f64());
        let jittered = capped * rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that denies the first `deny` attempts, then allows.
    struct ScriptedStore {
        deny: u32,
        seen: AtomicU32,
    }

    #[async_trait]
    impl CounterStore for ScriptedStore {
        async fn consume(
            &self,
            _key: &str,
            _points: u32,
            _limit: u32,
            _ttl: Duration,
        ) -> Result<Consumption> {
            let attempt = self.seen.fetch_add(1, Ordering::SeqCst);
            if attempt < self.deny {
                Ok(Consumption::Denied { retry_after: None })
            } else {
                Ok(Consumption::Allowed)
            }
        }
    }

    /// Store whose backend is unreachable.
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn consume(
            &self,
            _key: &str,
            _points: u32,
            _limit: u32,
            _ttl: Duration,
        ) -> Result<Consumption> {
            Err(anyhow::anyhow!("connection refused").into())
        }
    }

    fn fast_config(max_attempts: u32) -> DistributedLimitConfig {
        DistributedLimitConfig {
            points: 10,
            window: Duration::from_secs(1),
            max_attempts,
            retry_base: Duration::from_millis(2),
            retry_growth: 2.0,
            retry_cap: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn admits_after_transient_denials() {
        let store = Arc::new(ScriptedStore {
            deny: 2,
            seen: AtomicU32::new(0),
        });
        let limiter = DistributedLimiter::new("p", fast_config(5), store.clone());

        limiter.admit().await.unwrap();
        assert_eq!(store.seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_is_a_rate_limit_error() {
        let store = Arc::new(ScriptedStore {
            deny: u32::MAX,
            seen: AtomicU32::new(0),
        });
        let limiter = DistributedLimiter::new("p", fast_config(3), store.clone());

        let error = limiter.admit().await.unwrap_err();
        assert!(error.is_rate_limit());
        // Initial attempt plus three retries.
        assert_eq!(store.seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_allowed() {
        let limiter = DistributedLimiter::new("p", fast_config(3), Arc::new(BrokenStore));

        assert_eq!(limiter.try_consume().await, Consumption::Allowed);
        limiter.admit().await.unwrap();
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let store = Arc::new(BrokenStore);
        let config = DistributedLimitConfig {
            retry_base: Duration::from_millis(100),
            retry_growth: 2.0,
            retry_cap: Duration::from_millis(300),
            ..fast_config(3)
        };
        let limiter = DistributedLimiter::new("p", config, store);

        // ±20% jitter bounds around 100ms, 200ms, then capped at 300ms.
        for _ in 0..50 {
            let first = limiter.retry_delay(0);
            assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));
            let second = limiter.retry_delay(1);
            assert!(second >= Duration::from_millis(160) && second <= Duration::from_millis(240));
            let capped = limiter.retry_delay(5);
            assert!(capped >= Duration::from_millis(240) && capped <= Duration::from_millis(360));
        }
    }
}
