//! End of run summary.
//!
//! A [`RunSummary`] is plain data computed from a sealed [`Snapshot`]; printing or
//! shipping it somewhere is left to the caller.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::TrendStats,
    error::SinkError,
    executor::RampOutcome,
    sink::{Snapshot, Tags, tags},
    threshold::{ThresholdResult, ThresholdSpec},
    workflow::names,
};

/// Latency and outcome counts of one operation.
///
/// Latencies are in milliseconds; every field is zero when the operation never ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub requests: u64,
    pub failed: u64,
    pub latency: TrendStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub operations: BTreeMap<String, OperationSummary>,
    /// Operation outcomes across all operations, retries not counted separately.
    pub requests: u64,
    pub iterations: u64,
    /// Share of successful outcomes, `None` when nothing was attempted.
    pub success_rate: Option<f64>,
    pub thresholds: Vec<ThresholdResult>,
    /// Whether every threshold held.
    pub passed: bool,
    pub vus_max: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl RunSummary {
    /// Summarize `operations` and evaluate `thresholds` against `snapshot`.
    pub fn build(
        snapshot: &Snapshot,
        operations: &[&str],
        thresholds: &[ThresholdSpec],
        ramp: &RampOutcome,
    ) -> Result<Self, SinkError> {
        let mut summaries = BTreeMap::new();
        for &operation in operations {
            summaries.insert(
                operation.to_string(),
                summarize_operation(snapshot, operation)?,
            );
        }

        let everything = Tags::new();
        let requests = snapshot
            .select(names::HTTP_REQS, &everything)?
            .map_or(0, |v| v.count());
        let iterations = snapshot
            .select(names::ITERATIONS, &everything)?
            .map_or(0, |v| v.count());
        let errors = snapshot.select(names::ERRORS, &everything)?;
        let success_rate = errors
            .as_ref()
            .and_then(|v| v.as_rate())
            .and_then(|rate| rate.value())
            .map(|failed| 1.0 - failed);

        let thresholds = thresholds
            .iter()
            .map(|spec| spec.evaluate(snapshot))
            .collect::<Result<Vec<_>, _>>()?;
        for result in &thresholds {
            match (result.passed, result.observed) {
                (false, Some(observed)) => tracing::warn!(
                    "Threshold {} {} failed with {observed}",
                    result.metric,
                    result.condition
                ),
                (true, None) => tracing::warn!(
                    "Threshold {} {} has no samples to judge",
                    result.metric,
                    result.condition
                ),
                _ => {}
            }
        }
        let passed = thresholds.iter().all(|t| t.passed);

        Ok(Self {
            operations: summaries,
            requests,
            iterations,
            success_rate,
            thresholds,
            passed,
            vus_max: ramp.vus_max,
            duration: ramp.duration,
        })
    }
}

fn summarize_operation(
    snapshot: &Snapshot,
    operation: &str,
) -> Result<OperationSummary, SinkError> {
    let by_type = tags([(names::TYPE_TAG, operation)]);
    let latency = snapshot
        .select(operation, &Tags::new())?
        .as_ref()
        .and_then(|v| v.as_trend())
        .and_then(|trend| trend.stats())
        .unwrap_or_default();
    let requests = snapshot
        .select(names::HTTP_REQS, &by_type)?
        .map_or(0, |v| v.count());
    let failed = snapshot
        .select(names::ERRORS, &by_type)?
        .as_ref()
        .and_then(|v| v.as_rate())
        .map_or(0, |rate| rate.trues());

    Ok(OperationSummary {
        requests,
        failed,
        latency,
    })
}
