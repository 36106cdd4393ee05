//! Per-provider circuit breaking.
//!
//! Each provider gets an independent state machine that trips after a burst
//! of failures, rejects calls while open, and probes its way back to closed
//! after a cooldown. Breakers live in an explicit [`BreakerRegistry`] owned
//! by the orchestration layer; a provider with no registered breaker runs
//! unguarded.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BarrageError, Result};

/// Configuration for a single provider's circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures within `failure_window` before the circuit
    /// opens (default: 5)
    pub failure_threshold: u32,
    /// Successes required during probation to close the circuit again
    /// (default: 2)
    pub success_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe
    /// (default: 30s)
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Failures older than this no longer count toward the threshold
    /// (default: 60s)
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Failure-isolation state machine for one provider.
///
/// All transitions happen under the interior mutex, so concurrent units
/// observe a consistent state. The open-to-half-open transition is driven
/// lazily by the next admission attempt once `open_timeout` has elapsed.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure_at: None,
                opened_at: None,
            }),
        }
    }

    /// Current state, without advancing it.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admit or reject a call. An open circuit whose cooldown has elapsed
    /// moves to half-open before the decision is made.
    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_timeout);
                if cooled_down {
                    tracing::info!(provider = %self.provider, "circuit half-open, admitting probe calls");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    Ok(())
                } else {
                    Err(BarrageError::CircuitOpen {
                        provider: self.provider.clone(),
                    })
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(provider = %self.provider, "circuit closed after successful probation");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.last_failure_at = None;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                // A stale streak no longer counts; this failure starts a new one.
                let stale = inner
                    .last_failure_at
                    .is_some_and(|at| now.duration_since(at) > self.config.failure_window);
                if stale {
                    inner.failures = 0;
                }
                inner.failures += 1;
                inner.last_failure_at = Some(now);
                if inner.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        provider = %self.provider,
                        failures = inner.failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // No tolerance during probation.
                tracing::warn!(provider = %self.provider, "probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.failures = 0;
                inner.successes = 0;
                inner.last_failure_at = Some(now);
                inner.opened_at = Some(now);
            }
            CircuitState::Open => {
                inner.last_failure_at = Some(now);
            }
        }
    }

    /// Run `op` under this circuit. The operation's own result passes
    /// through untouched; the only synthesized outcome is the fail-fast
    /// rejection while the circuit is open, in which case `op` is never
    /// polled.
    pub async fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.admit()?;
        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                if error.trips_breaker() {
                    self.record_failure();
                }
                Err(error)
            }
        }
    }
}

/// Explicit map of provider name to circuit breaker.
///
/// Owned by the orchestration layer and shared by reference with every unit
/// of work; never global state.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: &str, config: BreakerConfig) {
        self.breakers.insert(
            provider.to_string(),
            Arc::new(CircuitBreaker::new(provider, config)),
        );
    }

    pub fn get(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(provider)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn state(&self, provider: &str) -> Option<CircuitState> {
        self.get(provider).map(|breaker| breaker.state())
    }

    /// Run `op` under the provider's breaker, or unguarded when none is
    /// registered.
    pub async fn execute<T, F>(&self, provider: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.get(provider) {
            Some(breaker) => breaker.execute(op).await,
            None => op.await,
        }
    }
}
