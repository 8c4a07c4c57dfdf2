//! Batch execution of every (input, brand) combination over one prefix cache.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::orchestrator::{Orchestrator, RunRequest};
use super::prefix_cache::PrefixCache;
use crate::cancellation::CancellationToken;
use crate::core::{Run, RunStatus};

/// Outcome of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Runs attempted.
    pub total: usize,
    /// Runs that ended COMPLETE.
    pub succeeded: usize,
    /// Runs that ended FAILED.
    pub failed: usize,
    /// Prefix computations started. Equals the number of distinct inputs
    /// unless a computation was cancelled and restarted.
    pub prefix_computations: usize,
    /// Wall-clock duration of the batch.
    pub duration_ms: u64,
    /// Terminal runs in input-major, brand-minor order.
    pub runs: Vec<Run>,
}

impl BatchReport {
    /// Runs for one input, in brand order.
    pub fn runs_for_input<'a>(&'a self, input_id: &'a str) -> impl Iterator<Item = &'a Run> + 'a {
        self.runs.iter().filter(move |r| r.input_id == input_id)
    }

    /// Returns true if every run completed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Runs batches with bounded concurrency.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    orchestrator: Arc<Orchestrator>,
    max_concurrent: usize,
}

impl BatchExecutor {
    /// Creates an executor running at most `max_concurrent` runs at once.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Runs every `inputs x brands` combination.
    ///
    /// All runs share one session [`PrefixCache`], so the input-only stages
    /// run once per input no matter how many brands there are. Cancelling
    /// `cancel` cancels every run still in flight.
    pub async fn run_batch(
        &self,
        inputs: &[String],
        brands: &[String],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let cache = PrefixCache::new();
        let requests: Vec<RunRequest> = inputs
            .iter()
            .flat_map(|input| brands.iter().map(move |brand| RunRequest::new(input, brand)))
            .collect();
        let total = requests.len();

        info!(
            inputs = inputs.len(),
            brands = brands.len(),
            total,
            max_concurrent = self.max_concurrent,
            "Batch started"
        );

        let orchestrator = &self.orchestrator;
        let cache_ref = &cache;
        let runs: Vec<Run> = stream::iter(requests)
            .map(|request| async move { orchestrator.execute(request, cache_ref, cancel).await })
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let succeeded = runs
            .iter()
            .filter(|r| r.overall_status == RunStatus::Complete)
            .count();
        let report = BatchReport {
            total,
            succeeded,
            failed: total - succeeded,
            prefix_computations: cache.computations(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            runs,
        };

        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            prefix_computations = report.prefix_computations,
            duration_ms = report.duration_ms,
            "Batch finished"
        );
        report
    }
}
