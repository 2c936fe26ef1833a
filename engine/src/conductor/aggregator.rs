//! Aggregator
//!
//! Folds per-task results into one report, ordered by dispatch sequence, with
//! the original batch attached.

use crate::conductor::types::{ExecutionReport, FatalResponse, ReportStatus, TaskBatch, TaskResult};
use sdk::errors::{EngineError, EngineErrorExt};
use tracing::{error, info};

/// Build the report for a batch whose dispatch loop completed
///
/// Failure entries are data; the status is `success` regardless of how many
/// tasks failed.
pub fn aggregate(batch: TaskBatch, mut results: Vec<(usize, TaskResult)>) -> ExecutionReport {
    results.sort_by_key(|(sequence, _)| *sequence);

    let report = ExecutionReport {
        status: ReportStatus::Success,
        results: results.into_iter().map(|(_, r)| r).collect(),
        original_analysis: batch,
    };

    info!(
        total = report.results.len(),
        failed = report.failure_count(),
        "batch aggregated"
    );
    report
}

/// Build the fatal response for an error outside task scope
pub fn fatal(err: &EngineError) -> FatalResponse {
    error!(
        hint = err.user_hint(),
        recoverable = err.is_recoverable(),
        "batch failed: {}",
        err
    );
    FatalResponse::new(err.to_string())
}
