//! Duplicate-submission detection.
//!
//! Two independent checks, in order: an exact idempotency-key match (any
//! status), then a content-fingerprint match against recent runs. The gate
//! is advisory, not transactional: two near-simultaneous identical
//! submissions can both pass before either run is persisted, yielding two
//! runs. That race is accepted; the gate stops retried and double-clicked
//! submissions, not adversarial ones.

use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::run::{Fingerprint, RunRecord, RunSpec, RunStatus};
use crate::store::RunStore;

/// How recently a fingerprint-identical run must have been created to
/// suppress a new submission.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Find an existing run this submission should collapse into, if any.
pub async fn find_existing<S>(
    store: &S,
    spec: &RunSpec,
    fingerprint: &Fingerprint,
) -> Result<Option<RunRecord>>
where
    S: RunStore + ?Sized,
{
    if let Some(key) = spec.idempotency_key.as_deref() {
        if let Some(run) = store.find_run_by_idempotency_key(key).await? {
            tracing::debug!(run_id = %run.id, key, "idempotency key matched existing run");
            return Ok(Some(run));
        }
    }

    for run in store.find_runs_by_fingerprint(fingerprint).await? {
        // Failed duplicates never suppress a resubmission, and neither do
        // cancelled ones: the caller just asked for that work to stop.
        if matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            continue;
        }
        let age = Utc::now().signed_duration_since(run.created_at);
        let fresh = age.to_std().map(|age| age <= FRESHNESS_WINDOW).unwrap_or(true);
        if fresh {
            tracing::debug!(
                run_id = %run.id,
                fingerprint = %fingerprint,
                "content fingerprint matched a fresh run"
            );
            return Ok(Some(run));
        }
    }

    Ok(None)
}
