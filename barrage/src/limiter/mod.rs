//! Rate limiting: a distributed quota shared across processes, smoothed by
//! per-process concurrency control.
//!
//! The [`LimiterRegistry`] owns both layers per provider. Distributed
//! consumption enforces the provider's global budget across every
//! cooperating worker; local scheduling then smooths bursts and caps
//! simultaneous connections from this process. Providers without a
//! registered limiter run unguarded.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;

pub mod distributed;
pub mod local;

pub use distributed::{Consumption, CounterStore, DistributedLimitConfig, DistributedLimiter};
pub use local::{LimiterStats, LocalLimiter, LocalLimiterConfig, ReservoirConfig};

struct ProviderLimits {
    local: Arc<LocalLimiter>,
    distributed: Option<Arc<DistributedLimiter>>,
}

/// Explicit map of provider name to rate-limiting state, owned by the
/// orchestration layer and shared by reference with every unit of work.
#[derive(Default)]
pub struct LimiterRegistry {
    providers: DashMap<String, ProviderLimits>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register local-only limiting for a provider.
    pub fn register(&self, provider: &str, local: LocalLimiterConfig) {
        self.providers.insert(
            provider.to_string(),
            ProviderLimits {
                local: LocalLimiter::new(provider, local),
                distributed: None,
            },
        );
    }

    /// Register local limiting plus a share of the global quota held in
    /// `store`.
    pub fn register_with_quota(
        &self,
        provider: &str,
        local: LocalLimiterConfig,
        quota: DistributedLimitConfig,
        store: Arc<dyn CounterStore>,
    ) {
        self.providers.insert(
            provider.to_string(),
            ProviderLimits {
                local: LocalLimiter::new(provider, local),
                distributed: Some(Arc::new(DistributedLimiter::new(provider, quota, store))),
            },
        );
    }

    /// Run `fut` behind the provider's limiters: global admission first
    /// (when a quota is registered), then the local queue. Exhausting the
    /// admission retry budget fails with a rate-limit error and `fut` is
    /// never polled. Unregistered providers run unguarded.
    pub async fn schedule<T, F>(&self, provider: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // Clone the handles out so no map shard lock is held across awaits.
        let limits = match self.providers.get(provider) {
            Some(entry) => (entry.local.clone(), entry.distributed.clone()),
            None => return fut.await,
        };
        let (local, distributed) = limits;

        if let Some(distributed) = distributed {
            distributed.admit().await?;
        }
        local.schedule(fut).await
    }

    /// Snapshot of the provider's local limiter counters, if registered.
    pub fn stats(&self, provider: &str) -> Option<LimiterStats> {
        self.providers
            .get(provider)
            .map(|entry| entry.local.stats())
    }

    /// Live-update the provider's concurrency bound. Returns false for
    /// unregistered providers.
    pub fn set_max_concurrent(&self, provider: &str, max_concurrent: usize) -> bool {
        match self.providers.get(provider) {
            Some(entry) => {
                entry.local.set_max_concurrent(max_concurrent);
                true
            }
            None => false,
        }
    }

    /// Live-update the provider's reservoir level. Returns false for
    /// unregistered providers.
    pub fn set_reservoir(&self, provider: &str, level: u64) -> bool {
        match self.providers.get(provider) {
            Some(entry) => {
                entry.local.set_reservoir(level);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysDeny;

    #[async_trait]
    impl CounterStore for AlwaysDeny {
        async fn consume(
            &self,
            _key: &str,
            _points: u32,
            _limit: u32,
            _ttl: Duration,
        ) -> Result<Consumption> {
            Ok(Consumption::Denied { retry_after: None })
        }
    }

    fn tight_quota() -> DistributedLimitConfig {
        DistributedLimitConfig {
            max_attempts: 1,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(2),
            ..DistributedLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn unregistered_provider_runs_unguarded() {
        let registry = LimiterRegistry::new();
        let result = registry.schedule("unknown", async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
        assert!(registry.stats("unknown").is_none());
    }

    #[tokio::test]
    async fn local_only_mode_schedules_through_the_queue() {
        let registry = LimiterRegistry::new();
        registry.register("p", LocalLimiterConfig::default());

        let result = registry.schedule("p", async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(registry.stats("p").unwrap().done, 1);
    }

    #[tokio::test]
    async fn denied_quota_fails_without_running_the_future() {
        let registry = LimiterRegistry::new();
        registry.register_with_quota(
            "p",
            LocalLimiterConfig::default(),
            tight_quota(),
            Arc::new(AlwaysDeny),
        );

        let mut ran = false;
        let result = registry
            .schedule("p", async {
                ran = true;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_rate_limit());
        assert!(!ran);
        // The local queue never saw the call.
        assert_eq!(registry.stats("p").unwrap().done, 0);
    }

    #[tokio::test]
    async fn live_updates_reach_the_local_limiter() {
        let registry = LimiterRegistry::new();
        registry.register("p", LocalLimiterConfig::default());

        assert!(registry.set_max_concurrent("p", 3));
        assert!(registry.set_reservoir("p", 7));
        assert!(!registry.set_max_concurrent("ghost", 3));
    }
}
