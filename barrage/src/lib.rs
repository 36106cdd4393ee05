//! Execution control for batched LLM requests.
//!
//! This crate fans batches of (prompt × model) work out to external LLM
//! providers while keeping three guarantees under partial failure:
//! - Admission control: a provider's global rate budget holds across all
//!   cooperating worker processes (shared counter ledger), and each process
//!   bounds its own concurrency and throughput locally
//! - Isolation: a provider with elevated failures is bypassed by a
//!   per-provider circuit breaker and heals itself without intervention
//! - Idempotent execution: retried or duplicated submissions collapse onto
//!   the existing run, and one unit's failure never aborts its siblings
//!
//! # Example
//! ```ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use barrage::{
//!     HttpProviderClient, InMemoryRunStore, Orchestrator, ProviderEndpoint,
//!     RunSpec, Target,
//! };
//!
//! let client = Arc::new(HttpProviderClient::new(HashMap::from([(
//!     "openai".to_string(),
//!     ProviderEndpoint {
//!         base_url: "https://api.openai.com".to_string(),
//!         api_key: std::env::var("OPENAI_API_KEY")?,
//!     },
//! )]))?);
//! let orchestrator = Arc::new(Orchestrator::new(Arc::new(InMemoryRunStore::new()), client));
//!
//! let submission = orchestrator
//!     .submit(RunSpec {
//!         prompts: vec!["What laptop should I buy?".to_string()],
//!         brands: vec!["Acme".to_string()],
//!         targets: vec![Target::new("openai", "gpt-4")],
//!         idempotency_key: None,
//!         config: Default::default(),
//!     })
//!     .await?;
//!
//! let run = orchestrator.get_run(submission.run.id).await?;
//! ```

pub mod backoff;
pub mod breaker;
pub mod dedup;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod provider;
pub mod run;
pub mod store;
pub mod summary;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use error::{BarrageError, Result};
pub use limiter::{
    Consumption, CounterStore, DistributedLimitConfig, DistributedLimiter, LimiterRegistry,
    LimiterStats, LocalLimiter, LocalLimiterConfig, ReservoirConfig,
};
pub use orchestrator::{Orchestrator, Submission};
pub use provider::{
    CallOptions, HttpProviderClient, MockProviderClient, ProviderClient, ProviderEndpoint,
    ProviderResponse, TokenUsage,
};
pub use run::{
    CostTable, Fingerprint, ModelRate, RunConfig, RunId, RunMetrics, RunRecord, RunSpec,
    RunStatus, Target, UnitId, UnitRecord, UnitStatus,
};
pub use store::{
    Entity, EntityId, EntityKind, InMemoryCounterStore, InMemoryRunStore, RunStore, UnitOutcome,
};
pub use summary::{
    AnalyzedResponse, BrandMentions, MentionAnalyzer, RunSummary, TargetSummary,
};
