//! Aggregated views over a run's unit results.
//!
//! Per-target aggregates are computed here from the persisted unit records.
//! Brand-mention metrics come from an injected [`MentionAnalyzer`]
//! collaborator and are consumed as data; the pattern matching itself lives
//! outside this crate.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::run::{RunId, RunMetrics, RunRecord, RunStatus, Target, UnitRecord, UnitStatus};

/// One successful response handed to the mention analyzer.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzedResponse<'a> {
    pub prompt: &'a str,
    pub target: &'a Target,
    pub text: &'a str,
}

/// Per-brand metrics produced by the analyzer.
#[derive(Debug, Clone, Serialize)]
pub struct BrandMentions {
    pub brand: String,
    /// Total mention occurrences across all responses
    pub mentions: u64,
    /// Responses containing at least one mention
    pub responses_mentioning: u64,
}

/// Collaborator computing brand-mention metrics over a run's responses.
pub trait MentionAnalyzer: Send + Sync {
    fn analyze(&self, brands: &[String], responses: &[AnalyzedResponse<'_>]) -> Vec<BrandMentions>;
}

/// Aggregates for one provider:model target within a run.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub target: Target,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean provider latency across this target's successful units
    #[serde(with = "humantime_serde")]
    pub mean_latency: Duration,
    pub total_tokens: u64,
}

/// Client-facing summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total_units: u64,
    pub completed_units: u64,
    pub failed_units: u64,
    pub per_target: Vec<TargetSummary>,
    pub brand_mentions: Vec<BrandMentions>,
    pub metrics: Option<RunMetrics>,
}

/// Build a summary from a run record and its unit records.
pub fn summarize(
    run: &RunRecord,
    units: &[UnitRecord],
    analyzer: Option<&dyn MentionAnalyzer>,
) -> RunSummary {
    #[derive(Default)]
    struct Accumulator {
        completed: u64,
        failed: u64,
        cancelled: u64,
        latency_sum: Duration,
        total_tokens: u64,
    }

    // BTreeMap keyed by display form for stable output ordering.
    let mut by_target: BTreeMap<String, (Target, Accumulator)> = BTreeMap::new();
    for unit in units {
        let entry = by_target
            .entry(unit.target.to_string())
            .or_insert_with(|| (unit.target.clone(), Accumulator::default()));
        match &unit.status {
            UnitStatus::Completed {
                latency,
                token_usage,
                ..
            } => {
                entry.1.completed += 1;
                entry.1.latency_sum += *latency;
                if let Some(usage) = token_usage {
                    entry.1.total_tokens += usage.total_tokens;
                }
            }
            UnitStatus::Failed { .. } => entry.1.failed += 1,
            UnitStatus::Cancelled { .. } => entry.1.cancelled += 1,
        }
    }

    let per_target = by_target
        .into_values()
        .map(|(target, acc)| TargetSummary {
            target,
            completed: acc.completed,
            failed: acc.failed,
            cancelled: acc.cancelled,
            mean_latency: if acc.completed > 0 {
                acc.latency_sum / acc.completed as u32
            } else {
                Duration::ZERO
            },
            total_tokens: acc.total_tokens,
        })
        .collect();

    let brand_mentions = match analyzer {
        Some(analyzer) if !run.spec.brands.is_empty() => {
            let responses: Vec<AnalyzedResponse<'_>> = units
                .iter()
                .filter_map(|unit| match &unit.status {
                    UnitStatus::Completed { text, .. } => Some(AnalyzedResponse {
                        prompt: &unit.prompt,
                        target: &unit.target,
                        text,
                    }),
                    _ => None,
                })
                .collect();
            analyzer.analyze(&run.spec.brands, &responses)
        }
        _ => Vec::new(),
    };

    RunSummary {
        run_id: run.id,
        status: run.status,
        total_units: run.total_units,
        completed_units: run.completed_units,
        failed_units: run.failed_units,
        per_target,
        brand_mentions,
        metrics: run.metrics.clone(),
    }
}
