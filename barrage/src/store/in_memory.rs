//! In-memory implementations of the storage contracts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{BarrageError, Result};
use crate::limiter::distributed::{Consumption, CounterStore};
use crate::run::{Fingerprint, RunId, RunMetrics, RunRecord, RunStatus, UnitRecord};
use crate::store::{Entity, EntityId, EntityKind, RunStore, UnitOutcome};

/// In-memory run store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<RunId, RunRecord>>,
    units: Mutex<HashMap<RunId, Vec<UnitRecord>>>,
    entities: Mutex<HashMap<(EntityKind, String), Entity>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    /// Rewrite a run's creation time. Test hook for exercising the dedup
    /// freshness window.
    #[cfg(test)]
    pub(crate) fn backdate_run(&self, id: RunId, created_at: chrono::DateTime<Utc>) {
        if let Some(run) = self.runs.lock().get_mut(&id) {
            run.created_at = created_at;
        }
    }

    fn with_run<T>(&self, id: RunId, mutate: impl FnOnce(&mut RunRecord) -> T) -> Result<T> {
        let mut runs = self.runs.lock();
        match runs.get_mut(&id) {
            Some(run) => Ok(mutate(run)),
            None => Err(BarrageError::RunNotFound(id)),
        }
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn find_or_create(&self, kind: EntityKind, natural_key: &str) -> Result<Entity> {
        // One lock covers lookup and insert, so concurrent callers converge
        // to a single entity.
        let mut entities = self.entities.lock();
        let entity = entities
            .entry((kind, natural_key.to_string()))
            .or_insert_with(|| Entity {
                id: EntityId::new(),
                kind,
                natural_key: natural_key.to_string(),
                created_at: Utc::now(),
            });
        Ok(entity.clone())
    }

    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.lock().insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.lock().get(&id).cloned())
    }

    async fn find_run_by_idempotency_key(&self, key: &str) -> Result<Option<RunRecord>> {
        let runs = self.runs.lock();
        Ok(runs
            .values()
            .find(|run| run.idempotency_key() == Some(key))
            .cloned())
    }

    async fn find_runs_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<RunRecord>> {
        let runs = self.runs.lock();
        let mut matches: Vec<RunRecord> = runs
            .values()
            .filter(|run| &run.fingerprint == fingerprint)
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn mark_run_started(&self, id: RunId) -> Result<()> {
        self.with_run(id, |run| {
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
        })
    }

    async fn record_unit(&self, unit: &UnitRecord) -> Result<()> {
        self.units
            .lock()
            .entry(unit.run_id)
            .or_default()
            .push(unit.clone());
        Ok(())
    }

    async fn update_run_progress(&self, id: RunId, outcome: UnitOutcome) -> Result<()> {
        self.with_run(id, |run| {
            match outcome {
                UnitOutcome::Completed => run.completed_units += 1,
                UnitOutcome::Failed => run.failed_units += 1,
            }
            debug_assert!(run.completed_units + run.failed_units <= run.total_units);
        })
    }

    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        metrics: Option<RunMetrics>,
    ) -> Result<()> {
        self.with_run(id, |run| {
            run.status = status;
            run.finished_at = Some(Utc::now());
            run.metrics = metrics;
        })
    }

    async fn units_for_run(&self, id: RunId) -> Result<Vec<UnitRecord>> {
        Ok(self.units.lock().get(&id).cloned().unwrap_or_default())
    }
}

#[derive(Debug)]
struct Ledger {
    remaining: u32,
    expires_at: Instant,
}

/// In-memory rate-limit ledger.
///
/// Stands in for the shared remote counter in tests and single-process
/// deployments; each key's consume is atomic under its entry lock, ledgers
/// self-expire and are recreated lazily.
#[derive(Default)]
pub struct InMemoryCounterStore {
    ledgers: DashMap<String, Ledger>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining points for a key, if a live ledger exists.
    pub fn remaining(&self, key: &str) -> Option<u32> {
        self.ledgers.get(key).and_then(|ledger| {
            (ledger.expires_at > Instant::now()).then_some(ledger.remaining)
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn consume(
        &self,
        key: &str,
        points: u32,
        limit: u32,
        ttl: Duration,
    ) -> Result<Consumption> {
        let now = Instant::now();
        let mut ledger = self.ledgers.entry(key.to_string()).or_insert_with(|| Ledger {
            remaining: limit,
            expires_at: now + ttl,
        });
        if ledger.expires_at <= now {
            ledger.remaining = limit;
            ledger.expires_at = now + ttl;
        }
        if ledger.remaining >= points {
            ledger.remaining -= points;
            Ok(Consumption::Allowed)
        } else {
            Ok(Consumption::Denied {
                retry_after: Some(ledger.expires_at - now),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunConfig, RunSpec, Target};

    fn sample_run() -> RunRecord {
        let spec = RunSpec {
            prompts: vec!["what is x".to_string()],
            brands: vec!["acme".to_string()],
            targets: vec![Target::new("openai", "gpt-4")],
            idempotency_key: Some("key-1".to_string()),
            config: RunConfig::default(),
        };
        let fingerprint = Fingerprint::compute(&spec);
        RunRecord::new(spec, fingerprint)
    }

    #[tokio::test]
    async fn find_or_create_converges_to_one_entity() {
        let store = std::sync::Arc::new(InMemoryRunStore::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .find_or_create(EntityKind::Prompt, "what is x")
                    .await
                    .unwrap()
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.entity_count(), 1);
    }

    #[tokio::test]
    async fn entities_are_keyed_by_kind_and_text() {
        let store = InMemoryRunStore::new();
        let prompt = store
            .find_or_create(EntityKind::Prompt, "acme")
            .await
            .unwrap();
        let brand = store
            .find_or_create(EntityKind::Brand, "acme")
            .await
            .unwrap();
        assert_ne!(prompt.id, brand.id);
        assert_eq!(store.entity_count(), 2);
    }

    #[tokio::test]
    async fn run_lifecycle_round_trip() {
        let store = InMemoryRunStore::new();
        let run = sample_run();
        let id = run.id;

        store.create_run(&run).await.unwrap();
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Pending
        );

        store.mark_run_started(id).await.unwrap();
        let fetched = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Running);
        assert!(fetched.started_at.is_some());

        store
            .update_run_progress(id, UnitOutcome::Completed)
            .await
            .unwrap();
        store
            .update_run_progress(id, UnitOutcome::Failed)
            .await
            .unwrap();
        let fetched = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(fetched.completed_units, 1);
        assert_eq!(fetched.failed_units, 1);

        store
            .finish_run(id, RunStatus::Partial, None)
            .await
            .unwrap();
        let fetched = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Partial);
        assert!(fetched.finished_at.is_some());
    }

    #[tokio::test]
    async fn lookup_by_key_and_fingerprint() {
        let store = InMemoryRunStore::new();
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let by_key = store
            .find_run_by_idempotency_key("key-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, run.id);
        assert!(store
            .find_run_by_idempotency_key("other")
            .await
            .unwrap()
            .is_none());

        let by_fingerprint = store
            .find_runs_by_fingerprint(&run.fingerprint)
            .await
            .unwrap();
        assert_eq!(by_fingerprint.len(), 1);
        assert_eq!(by_fingerprint[0].id, run.id);
    }

    #[tokio::test]
    async fn progress_on_unknown_run_is_not_found() {
        let store = InMemoryRunStore::new();
        let missing = RunId::new();
        let error = store
            .update_run_progress(missing, UnitOutcome::Completed)
            .await
            .unwrap_err();
        assert!(matches!(error, BarrageError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn counter_store_enforces_the_budget() {
        let store = InMemoryCounterStore::new();
        let ttl = Duration::from_secs(60);

        for _ in 0..3 {
            assert_eq!(
                store.consume("openai", 1, 3, ttl).await.unwrap(),
                Consumption::Allowed
            );
        }
        match store.consume("openai", 1, 3, ttl).await.unwrap() {
            Consumption::Denied { retry_after } => {
                assert!(retry_after.unwrap() <= ttl);
            }
            Consumption::Allowed => panic!("fourth consume should be denied"),
        }
        assert_eq!(store.remaining("openai"), Some(0));
    }

    #[tokio::test]
    async fn counter_store_resets_after_expiry() {
        let store = InMemoryCounterStore::new();
        let ttl = Duration::from_millis(30);

        assert_eq!(
            store.consume("k", 1, 1, ttl).await.unwrap(),
            Consumption::Allowed
        );
        assert!(matches!(
            store.consume("k", 1, 1, ttl).await.unwrap(),
            Consumption::Denied { .. }
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            store.consume("k", 1, 1, ttl).await.unwrap(),
            Consumption::Allowed
        );
    }

    #[tokio::test]
    async fn counter_store_keys_are_independent() {
        let store = InMemoryCounterStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.consume("a", 1, 1, ttl).await.unwrap(),
            Consumption::Allowed
        );
        assert!(matches!(
            store.consume("a", 1, 1, ttl).await.unwrap(),
            Consumption::Denied { .. }
        ));
        assert_eq!(
            store.consume("b", 1, 1, ttl).await.unwrap(),
            Consumption::Allowed
        );
    }
}
