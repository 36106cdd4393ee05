//! Run and unit-of-work data model.
//!
//! A run is one client-submitted batch: every prompt crossed with every
//! provider:model target. Units are the individual (prompt, target) calls;
//! each owns its own retry counter and result slot and is terminal once a
//! result is recorded.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BarrageError, Result};
use crate::provider::TokenUsage;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run_{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit_{}", &self.0.to_string()[..8])
    }
}

/// One provider:model pair a run fans out to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub provider: String,
    pub model: String,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Execution knobs for one run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Units concurrently in flight; excess units wait (default: 10)
    pub concurrency_limit: usize,
    /// Retries per unit after the initial attempt (default: 3)
    pub retry_attempts: u32,
    /// Deadline per provider call attempt (default: 30s)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Route calls through the per-provider circuit breakers
    /// (default: true)
    pub circuit_breaker_enabled: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            retry_attempts: 3,
            timeout: Duration::from_secs(30),
            circuit_breaker_enabled: true,
        }
    }
}

/// A client-submitted batch: prompts × targets, plus tracked brands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub brands: Vec<String>,
    pub targets: Vec<Target>,
    /// Caller-supplied token that collapses retried submissions
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub config: RunConfig,
}

impl RunSpec {
    pub fn validate(&self) -> Result<()> {
        if self.prompts.is_empty() {
            return Err(BarrageError::InvalidSpec("no prompts".to_string()));
        }
        if self.targets.is_empty() {
            return Err(BarrageError::InvalidSpec("no targets".to_string()));
        }
        Ok(())
    }

    pub fn total_units(&self) -> u64 {
        self.prompts.len() as u64 * self.targets.len() as u64
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Every unit succeeded
    Completed,
    /// Some units succeeded, some failed
    Partial,
    /// Every unit failed
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Aggregate measurements for a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    /// Wall-clock time from first dispatch to last terminal unit
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Mean provider latency across successful units
    #[serde(with = "humantime_serde")]
    pub mean_latency: Duration,
    /// Total tokens across successful units
    pub total_tokens: u64,
    /// Cost estimate from the per-model rate table
    pub estimated_cost: f64,
}

/// Content fingerprint of a run spec: a stable hash over the sorted,
/// normalized prompt list, brand list, and provider:model pairs. Always
/// computed, used for duplicate detection when no idempotency key is given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(spec: &RunSpec) -> Self {
        let mut prompts: Vec<String> =
            spec.prompts.iter().map(|p| p.trim().to_string()).collect();
        prompts.sort();
        let mut brands: Vec<String> = spec
            .brands
            .iter()
            .map(|b| b.trim().to_lowercase())
            .collect();
        brands.sort();
        let mut targets: Vec<String> = spec.targets.iter().map(|t| t.to_string()).collect();
        targets.sort();

        // Length-framed so section and item boundaries are unambiguous.
        let mut hasher = Sha256::new();
        for section in [&prompts, &brands, &targets] {
            hasher.update((section.len() as u64).to_be_bytes());
            for item in section {
                hasher.update((item.len() as u64).to_be_bytes());
                hasher.update(item.as_bytes());
            }
        }

        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Fingerprint(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// Persistent record of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: RunId,
    pub status: RunStatus,
    pub total_units: u64,
    pub completed_units: u64,
    pub failed_units: u64,
    pub fingerprint: Fingerprint,
    pub spec: RunSpec,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: Option<RunMetrics>,
}

impl RunRecord {
    pub fn new(spec: RunSpec, fingerprint: Fingerprint) -> Self {
        Self {
            id: RunId::new(),
            status: RunStatus::Pending,
            total_units: spec.total_units(),
            completed_units: 0,
            failed_units: 0,
            fingerprint,
            spec,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            metrics: None,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.spec.idempotency_key.as_deref()
    }
}

/// Terminal state of a unit of work.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Completed {
        text: String,
        #[serde(with = "humantime_serde")]
        latency: Duration,
        token_usage: Option<TokenUsage>,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
}

/// Persistent record of one attempted unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    pub id: UnitId,
    pub run_id: RunId,
    pub prompt: String,
    pub target: Target,
    /// Retries consumed beyond the initial attempt
    pub retries: u32,
    pub status: UnitStatus,
}

impl UnitRecord {
    pub fn completed(
        run_id: RunId,
        prompt: String,
        target: Target,
        retries: u32,
        response: &crate::provider::ProviderResponse,
    ) -> Self {
        Self {
            id: UnitId::new(),
            run_id,
            prompt,
            target,
            retries,
            status: UnitStatus::Completed {
                text: response.text.clone(),
                latency: response.latency,
                token_usage: response.token_usage,
                completed_at: Utc::now(),
            },
        }
    }

    pub fn failed(
        run_id: RunId,
        prompt: String,
        target: Target,
        retries: u32,
        error: &BarrageError,
    ) -> Self {
        Self {
            id: UnitId::new(),
            run_id,
            prompt,
            target,
            retries,
            status: UnitStatus::Failed {
                error: error.to_string(),
                failed_at: Utc::now(),
            },
        }
    }

    pub fn cancelled(run_id: RunId, prompt: String, target: Target, retries: u32) -> Self {
        Self {
            id: UnitId::new(),
            run_id,
            prompt,
            target,
            retries,
            status: UnitStatus::Cancelled {
                cancelled_at: Utc::now(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, UnitStatus::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, UnitStatus::Failed { .. })
    }
}

/// Per-model pricing, consumed as data. Unknown models cost zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

/// Static lookup table from model name to rate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTable {
    rates: HashMap<String, ModelRate>,
}

impl CostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, model: &str, rate: ModelRate) -> Self {
        self.rates.insert(model.to_string(), rate);
        self
    }

    pub fn estimate(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.rates.get(model) {
            Some(rate) => {
                rate.prompt_per_1k * usage.prompt_tokens as f64 / 1000.0
                    + rate.completion_per_1k * usage.completion_tokens as f64 / 1000.0
            }
            None => 0.0,
        }
    }
}
