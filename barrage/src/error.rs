use std::time::Duration;

use thiserror::Error;

use crate::run::RunId;

/// Result type for barrage operations.
pub type Result<T> = std::result::Result<T, BarrageError>;

/// Errors that can occur while submitting or executing runs.
#[derive(Debug, Error)]
pub enum BarrageError {
    /// Retryable provider failure: network error, timeout, or a
    /// 5xx-equivalent upstream response.
    #[error("transient failure from provider {provider}: {message}")]
    TransientProvider { provider: String, message: String },

    /// The rate limit budget for a provider was exhausted. Handled by the
    /// limiters' own retry schedule, never retried at the unit level.
    #[error("rate limit budget exhausted for provider {provider}")]
    RateLimited { provider: String },

    /// The circuit for a provider is open; the call was rejected without
    /// reaching the provider.
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// The provider rejected the request outright (4xx-equivalent).
    #[error("provider {provider} rejected the request: {message}")]
    Provider { provider: String, message: String },

    /// The provider is unusable as configured (missing credentials,
    /// unknown endpoint). Raised at construction or lookup time, not per
    /// call attempt.
    #[error("provider {provider} is not configured: {message}")]
    Configuration { provider: String, message: String },

    /// Run id unknown to the store.
    #[error("run {0} not found")]
    RunNotFound(RunId),

    /// The submitted spec cannot produce any work.
    #[error("invalid run spec: {0}")]
    InvalidSpec(String),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BarrageError {
    /// A provider call that exceeded its deadline. The in-flight call is
    /// dropped, so this is always safe to retry.
    pub fn timeout(provider: &str, timeout: Duration) -> Self {
        Self::TransientProvider {
            provider: provider.to_string(),
            message: format!(
                "call timed out after {}",
                humantime::format_duration(timeout)
            ),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this error counts toward a circuit breaker's failure
    /// threshold. Rate limiting says nothing about provider health, and a
    /// rejection from an already-open circuit must not re-trip it.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, Self::RateLimited { .. } | Self::CircuitOpen { .. })
    }
}
