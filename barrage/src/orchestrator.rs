//! Batch orchestration: submission, fan-out, retries, terminal accounting.
//!
//! `submit` gates each submission through duplicate detection, interns its
//! prompt and brand entities, persists the run, and spawns the execution
//! task. Execution fans one unit of work out per (prompt, target) pair with
//! a bounded number concurrently in flight; each unit flows through
//! distributed admission, the local queue, and the provider's circuit
//! breaker before the call itself. A unit exhausting its retries never
//! aborts its siblings; the run only reaches a terminal status once every
//! unit has.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::breaker::BreakerRegistry;
use crate::dedup;
use crate::error::{BarrageError, Result};
use crate::limiter::LimiterRegistry;
use crate::provider::{CallOptions, ProviderClient, ProviderResponse};
use crate::run::{
    CostTable, Fingerprint, RunConfig, RunId, RunMetrics, RunRecord, RunSpec, RunStatus, Target,
    UnitRecord, UnitStatus,
};
use crate::store::{EntityKind, RunStore, UnitOutcome};
use crate::summary::{summarize, MentionAnalyzer, RunSummary};

/// Result of a submission: the run, and whether this call created it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub run: RunRecord,
    pub is_new: bool,
}

/// Fans batches of (prompt × target) work out to providers and records the
/// results.
///
/// Owns the limiter and breaker registries and passes them by reference to
/// every unit of work; nothing here is ambient or static, so independent
/// orchestrators (and tests) never share state.
pub struct Orchestrator<S, P> {
    store: Arc<S>,
    client: Arc<P>,
    limiters: Arc<LimiterRegistry>,
    breakers: Arc<BreakerRegistry>,
    cost_table: Arc<CostTable>,
    analyzer: Option<Arc<dyn MentionAnalyzer>>,
    backoff: BackoffPolicy,
    active: Arc<DashMap<RunId, CancellationToken>>,
}

// Handles share all state, so a clone handed to a spawned execution task
// sees the same registries and active-run map as the original.
impl<S, P> Clone for Orchestrator<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            limiters: Arc::clone(&self.limiters),
            breakers: Arc::clone(&self.breakers),
            cost_table: Arc::clone(&self.cost_table),
            analyzer: self.analyzer.clone(),
            backoff: self.backoff.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

impl<S, P> Orchestrator<S, P>
where
    S: RunStore + 'static,
    P: ProviderClient + 'static,
{
    pub fn new(store: Arc<S>, client: Arc<P>) -> Self {
        Self {
            store,
            client,
            limiters: Arc::new(LimiterRegistry::new()),
            breakers: Arc::new(BreakerRegistry::new()),
            cost_table: Arc::new(CostTable::default()),
            analyzer: None,
            backoff: BackoffPolicy::default(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_limiters(mut self, limiters: Arc<LimiterRegistry>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_cost_table(mut self, cost_table: CostTable) -> Self {
        self.cost_table = Arc::new(cost_table);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn MentionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Submit a batch. Returns the existing run (`is_new = false`) when the
    /// dedup gate finds one; otherwise creates the run, spawns its
    /// execution, and returns immediately with `is_new = true`.
    ///
    /// Only setup-time failures propagate from here: an invalid spec, or
    /// the store failing before any unit has started.
    #[tracing::instrument(skip(self, spec), fields(prompts = spec.prompts.len(), targets = spec.targets.len()))]
    pub async fn submit(&self, spec: RunSpec) -> Result<Submission> {
        spec.validate()?;
        let fingerprint = Fingerprint::compute(&spec);

        if let Some(existing) =
            dedup::find_existing(self.store.as_ref(), &spec, &fingerprint).await?
        {
            tracing::info!(run_id = %existing.id, "duplicate submission, returning existing run");
            return Ok(Submission {
                run: existing,
                is_new: false,
            });
        }

        // Intern prompts and brands up front; concurrent submissions of the
        // same text converge to one entity inside the store.
        let interning = spec
            .prompts
            .iter()
            .map(|prompt| self.store.find_or_create(EntityKind::Prompt, prompt))
            .chain(
                spec.brands
                    .iter()
                    .map(|brand| self.store.find_or_create(EntityKind::Brand, brand)),
            );
        futures::future::try_join_all(interning).await?;

        let run = RunRecord::new(spec, fingerprint);
        self.store.create_run(&run).await?;
        tracing::info!(run_id = %run.id, total_units = run.total_units, "run accepted");

        let cancel = CancellationToken::new();
        self.active.insert(run.id, cancel.clone());
        let executor = self.clone();
        let record = run.clone();
        tokio::spawn(async move { executor.execute_run(record, cancel).await });

        Ok(Submission { run, is_new: true })
    }

    /// Fetch a run by id.
    pub async fn get_run(&self, id: RunId) -> Result<RunRecord> {
        self.store
            .get_run(id)
            .await?
            .ok_or(BarrageError::RunNotFound(id))
    }

    /// Aggregated per-target and per-brand view of a run.
    pub async fn get_run_summary(&self, id: RunId) -> Result<RunSummary> {
        let run = self.get_run(id).await?;
        let units = self.store.units_for_run(id).await?;
        Ok(summarize(&run, &units, self.analyzer.as_deref()))
    }

    /// Request cancellation of a run. Units not yet dispatched end
    /// `cancelled`; in-flight calls run to completion. Returns false when
    /// the run is already terminal.
    pub async fn cancel_run(&self, id: RunId) -> Result<bool> {
        let run = self.get_run(id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        match self.active.get(&id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %id, "run cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[tracing::instrument(skip(self, run, cancel), fields(run_id = %run.id))]
    async fn execute_run(self, run: RunRecord, cancel: CancellationToken) {
        let run_id = run.id;
        let started = Instant::now();

        if let Err(error) = self.store.mark_run_started(run_id).await {
            tracing::error!(run_id = %run_id, error = %error, "could not mark run as running");
            let _ = self.store.finish_run(run_id, RunStatus::Failed, None).await;
            self.active.remove(&run_id);
            return;
        }

        let config = run.spec.config.clone();
        let semaphore = Arc::new(Semaphore::new(config.concurrency_limit.max(1)));
        let mut join_set: JoinSet<UnitRecord> = JoinSet::new();

        for prompt in &run.spec.prompts {
            for target in &run.spec.targets {
                let this = self.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let prompt = prompt.clone();
                let target = target.clone();
                let config = config.clone();
                join_set.spawn(async move {
                    // Bounds the number of units concurrently in flight;
                    // excess units wait their turn here.
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    match permit {
                        Some(_permit) => {
                            this.run_unit(run_id, prompt, target, &config, &cancel).await
                        }
                        None => {
                            let unit = UnitRecord::cancelled(run_id, prompt, target, 0);
                            this.persist_unit(&unit).await;
                            unit
                        }
                    }
                });
            }
        }

        // Join barrier: the run is terminal only once every unit is.
        let mut outcomes: Vec<UnitRecord> = Vec::with_capacity(run.total_units as usize);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(unit) => outcomes.push(unit),
                Err(join_error) => {
                    tracing::error!(run_id = %run_id, error = %join_error, "unit task panicked");
                }
            }
        }

        let completed = outcomes.iter().filter(|unit| unit.is_completed()).count() as u64;
        let failed = outcomes.iter().filter(|unit| unit.is_failed()).count() as u64;
        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if failed == 0 {
            RunStatus::Completed
        } else if completed == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        let metrics = self.compute_metrics(&outcomes, started.elapsed());
        if let Err(error) = self.store.finish_run(run_id, status, Some(metrics)).await {
            tracing::error!(run_id = %run_id, error = %error, "could not persist terminal run state");
        }
        self.active.remove(&run_id);
        tracing::info!(
            run_id = %run_id,
            status = ?status,
            completed,
            failed,
            duration = %humantime::format_duration(started.elapsed()),
            "run finished"
        );
    }

    /// Drive one unit of work to a terminal state. Rate-limit and
    /// circuit-open rejections are terminal immediately: the limiters
    /// already retried admission on their own schedule, and an open circuit
    /// is a deliberate bypass, not a provider failure. Everything else
    /// retries with backoff until the budget runs out.
    async fn run_unit(
        &self,
        run_id: RunId,
        prompt: String,
        target: Target,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> UnitRecord {
        let mut retries = 0u32;
        let record = loop {
            if cancel.is_cancelled() {
                break UnitRecord::cancelled(run_id, prompt.clone(), target.clone(), retries);
            }
            match self.attempt(&prompt, &target, config).await {
                Ok(response) => {
                    break UnitRecord::completed(
                        run_id,
                        prompt.clone(),
                        target.clone(),
                        retries,
                        &response,
                    );
                }
                Err(error) if error.is_rate_limit() || error.is_circuit_open() => {
                    tracing::warn!(run_id = %run_id, target = %target, error = %error, "unit rejected");
                    break UnitRecord::failed(run_id, prompt.clone(), target.clone(), retries, &error);
                }
                Err(error) => {
                    if retries >= config.retry_attempts {
                        tracing::warn!(
                            run_id = %run_id,
                            target = %target,
                            retries,
                            error = %error,
                            "unit failed, retries exhausted"
                        );
                        break UnitRecord::failed(
                            run_id,
                            prompt.clone(),
                            target.clone(),
                            retries,
                            &error,
                        );
                    }
                    retries += 1;
                    let delay = self.backoff.delay(retries);
                    tracing::debug!(
                        run_id = %run_id,
                        target = %target,
                        retry = retries,
                        delay = %humantime::format_duration(delay),
                        error = %error,
                        "unit failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        self.persist_unit(&record).await;
        record
    }

    /// One provider call attempt through the full admission stack:
    /// distributed quota, local queue, circuit breaker, then the call under
    /// its deadline.
    async fn attempt(
        &self,
        prompt: &str,
        target: &Target,
        config: &RunConfig,
    ) -> Result<ProviderResponse> {
        let provider = target.provider.as_str();
        let opts = CallOptions {
            provider: target.provider.clone(),
            model: target.model.clone(),
            timeout: config.timeout,
        };
        let client = Arc::clone(&self.client);
        let deadline = config.timeout;
        let prompt = prompt.to_string();
        let timeout_provider = target.provider.clone();
        let call = async move {
            match tokio::time::timeout(deadline, client.call(&prompt, &opts)).await {
                Ok(result) => result,
                // Dropping the call aborts it, so a hung provider cannot
                // pin a worker slot past the deadline.
                Err(_) => Err(BarrageError::timeout(&timeout_provider, deadline)),
            }
        };

        if config.circuit_breaker_enabled {
            self.limiters
                .schedule(provider, self.breakers.execute(provider, call))
                .await
        } else {
            self.limiters.schedule(provider, call).await
        }
    }

    /// Persist a terminal unit record and bump the run's progress counts.
    /// Failures here are logged, never propagated: a storage hiccup must
    /// not take sibling units down with it.
    async fn persist_unit(&self, unit: &UnitRecord) {
        if let Err(error) = self.store.record_unit(unit).await {
            tracing::error!(unit_id = %unit.id, error = %error, "could not persist unit result");
        }
        let outcome = match unit.status {
            UnitStatus::Completed { .. } => Some(UnitOutcome::Completed),
            UnitStatus::Failed { .. } => Some(UnitOutcome::Failed),
            UnitStatus::Cancelled { .. } => None,
        };
        if let Some(outcome) = outcome {
            if let Err(error) = self.store.update_run_progress(unit.run_id, outcome).await {
                tracing::error!(run_id = %unit.run_id, error = %error, "could not update run progress");
            }
        }
    }

    fn compute_metrics(&self, outcomes: &[UnitRecord], duration: Duration) -> RunMetrics {
        let mut latency_sum = Duration::ZERO;
        let mut successes: u32 = 0;
        let mut total_tokens = 0u64;
        let mut estimated_cost = 0f64;
        for unit in outcomes {
            if let UnitStatus::Completed {
                latency,
                token_usage,
                ..
            } = &unit.status
            {
                successes += 1;
                latency_sum += *latency;
                if let Some(usage) = token_usage {
                    total_tokens += usage.total_tokens;
                    estimated_cost += self.cost_table.estimate(&unit.target.model, usage);
                }
            }
        }
        RunMetrics {
            duration,
            mean_latency: if successes > 0 {
                latency_sum / successes
            } else {
                Duration::ZERO
            },
            total_tokens,
            estimated_cost,
        }
    }
}
