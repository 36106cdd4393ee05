//! Storage contracts for runs, interned entities, and unit results.
//!
//! The `RunStore` trait provides the operations the orchestrator needs:
//! find-or-create interning for prompt and brand entities, run creation and
//! lookup, and progress/metrics updates. Each call is assumed atomic on its
//! own; nothing is transactional across calls. The in-memory implementation
//! backs tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::run::{Fingerprint, RunId, RunMetrics, RunRecord, RunStatus, UnitRecord};

pub mod in_memory;

pub use in_memory::{InMemoryCounterStore, InMemoryRunStore};

/// Kinds of interned entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Prompt,
    Brand,
}

/// Unique identifier for an interned entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ent_{}", &self.0.to_string()[..8])
    }
}

/// An interned prompt or brand.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub natural_key: String,
    pub created_at: DateTime<Utc>,
}

/// Which way a unit went, for progress accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    Failed,
}

/// Persistence operations the orchestrator depends on.
///
/// Every method is atomic per call. `find_or_create` must be idempotent
/// under concurrency: two callers interning the same natural key converge
/// to one entity, never duplicates.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn find_or_create(&self, kind: EntityKind, natural_key: &str) -> Result<Entity>;

    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>>;

    async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>>;

    /// All runs with this fingerprint, newest first.
    async fn find_runs_by_fingerprint(&self, fingerprint: &Fingerprint)
        -> Result<Vec<RunRecord>>;

    /// Transition the run to running and stamp `started_at`.
    async fn mark_run_started(&self, id: RunId) -> Result<()>;

    /// Persist a terminal unit record.
    async fn record_unit(&self, unit: &UnitRecord) -> Result<()>;

    /// Bump the completed or failed count by one.
    async fn update_run_progress(&self, id: RunId, outcome: UnitOutcome) -> Result<()>;

    /// Set the terminal status, stamp `finished_at`, and attach metrics.
    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        metrics: Option<RunMetrics>,
    ) -> Result<()>;

    async fn units_for_run(&self, id: RunId) -> Result<Vec<UnitRecord>>;
}
