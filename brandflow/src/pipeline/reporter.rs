//! Best-effort, retried status reporting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::retry::{execute_with_retry, with_timeout, RetryError, RetryPolicy};
use crate::cancellation::CancellationToken;
use crate::core::Run;
use crate::errors::{ErrorPayload, Failure};
use crate::ports::{StageStatusUpdate, StateStore};

/// Sends run and stage status to the [`StateStore`] through the retry policy.
///
/// Reports are awaited one at a time by the owning run, so a reader of the
/// store sees them in stage order. A report that still fails after the last
/// attempt is logged and dropped; it never fails the run.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn StateStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("policy", &self.policy)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl StatusReporter {
    /// Creates a reporter.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            call_timeout,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn deliver<F, Fut>(
        &self,
        what: &'static str,
        run_id: &str,
        stage: u8,
        cancel: &CancellationToken,
        call: F,
    ) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        let limit = self.call_timeout;
        let result = execute_with_retry(&self.policy, stage, cancel, |_| {
            with_timeout(limit, what, call())
        })
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    run_id,
                    stage,
                    report = what,
                    code = %e.record().code,
                    attempts = e.attempts(),
                    error = %e,
                    "Status report abandoned"
                );
                false
            }
        }
    }

    /// Reports one stage transition. Returns whether the store acknowledged it.
    pub async fn stage(&self, update: &StageStatusUpdate, cancel: &CancellationToken) -> bool {
        self.deliver(
            "stage status report",
            &update.run_id,
            update.stage_number,
            cancel,
            || self.store.report_stage_status(update),
        )
        .await
    }

    /// Reports the run record.
    pub async fn run(&self, run: &Run, cancel: &CancellationToken) -> bool {
        self.deliver("run report", &run.run_id, run.current_stage, cancel, || {
            self.store.report_run(run)
        })
        .await
    }

    /// Reports a failed run's error payload.
    pub async fn failure(&self, payload: &ErrorPayload, cancel: &CancellationToken) -> bool {
        self.deliver(
            "failure report",
            &payload.run_id,
            payload.error.stage,
            cancel,
            || self.store.report_failure(payload),
        )
        .await
    }

    /// Reads a run back from the store, retrying transient failures.
    pub async fn fetch(&self, run_id: &str) -> Result<Option<Run>, RetryError> {
        let limit = self.call_timeout;
        execute_with_retry(&self.policy, 0, &CancellationToken::new(), |_| {
            with_timeout(limit, "run lookup", self.store.fetch_run(run_id))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::testing::FlakyStateStore;
    use crate::ports::InMemoryStateStore;

    fn update(stage: u8) -> StageStatusUpdate {
        StageStatusUpdate {
            run_id: "run-1".to_string(),
            stage_number: stage,
            stage_name: format!("stage {stage}"),
            status: StageStatus::Processing,
            output: None,
            error_code: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let inner = InMemoryStateStore::new();
        let store = Arc::new(FlakyStateStore::new(inner.clone(), 2));
        let reporter =
            StatusReporter::new(store.clone(), RetryPolicy::immediate(3), Duration::from_secs(1));

        assert!(reporter.stage(&update(1), &CancellationToken::new()).await);
        assert_eq!(store.calls(), 3);
        assert_eq!(inner.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_report_returns_false() {
        let inner = InMemoryStateStore::new();
        let store = Arc::new(FlakyStateStore::new(inner.clone(), 10));
        let reporter =
            StatusReporter::new(store.clone(), RetryPolicy::immediate(3), Duration::from_secs(1));

        assert!(!reporter.stage(&update(2), &CancellationToken::new()).await);
        assert_eq!(store.calls(), 3);
        assert!(inner.updates().is_empty());
    }

    #[tokio::test]
    async fn test_reports_arrive_in_order() {
        let inner = InMemoryStateStore::new();
        let store = Arc::new(FlakyStateStore::new(inner.clone(), 1));
        let reporter = StatusReporter::new(store, RetryPolicy::immediate(3), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for stage in 1..=5 {
            reporter.stage(&update(stage), &cancel).await;
        }
        let order: Vec<u8> = inner.updates().iter().map(|u| u.stage_number).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_fetch_unknown_run() {
        let reporter = StatusReporter::new(
            Arc::new(InMemoryStateStore::new()),
            RetryPolicy::immediate(3),
            Duration::from_secs(1),
        );
        assert_eq!(reporter.fetch("nope").await.unwrap(), None);
    }
}
