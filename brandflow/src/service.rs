//! Submission and status surface.
//!
//! [`PipelineService::submit`] starts a run on its own task and returns at
//! once. Progress is read back through the state store with
//! [`PipelineService::status`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use crate::cancellation::CancellationToken;
use crate::core::Run;
use crate::errors::BrandflowError;
use crate::pipeline::{Orchestrator, PrefixCache, RunRequest};

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Identifier to poll with.
    pub run_id: String,
    /// Always `"running"`.
    pub status: String,
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<Run>,
}

/// Accepts run requests and tracks their tasks.
pub struct PipelineService {
    orchestrator: Arc<Orchestrator>,
    active: DashMap<String, ActiveRun>,
}

impl std::fmt::Debug for PipelineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineService")
            .field("orchestrator", &self.orchestrator)
            .field("tracked_runs", &self.active.len())
            .finish()
    }
}

impl PipelineService {
    /// Creates a service around an orchestrator.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            active: DashMap::new(),
        }
    }

    /// Starts a run in the background.
    ///
    /// A standalone submission gets its own prefix cache. Finished runs are
    /// pruned first, so the id of a finished run may be submitted again.
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, request: RunRequest) -> Result<SubmitResponse, BrandflowError> {
        self.prune_finished();
        let run_id = request.resolve_run_id();
        let Entry::Vacant(slot) = self.active.entry(run_id.clone()) else {
            return Err(BrandflowError::DuplicateRun(run_id));
        };

        let cancel = CancellationToken::new();
        let orchestrator = Arc::clone(&self.orchestrator);
        let token = cancel.clone();
        let request = request.with_run_id(run_id.clone());
        let span = tracing::info_span!("submitted_run", run_id = %run_id);
        let handle = tokio::spawn(
            async move {
                let cache = PrefixCache::new();
                orchestrator.execute(request, &cache, &token).await
            }
            .instrument(span),
        );

        slot.insert(ActiveRun { cancel, handle });
        info!(run_id = %run_id, "Run submitted");
        Ok(SubmitResponse {
            run_id,
            status: "running".to_string(),
        })
    }

    /// Reads the run record from the state store.
    pub async fn status(&self, run_id: &str) -> Result<Run, BrandflowError> {
        self.orchestrator
            .reporter()
            .fetch(run_id)
            .await?
            .ok_or_else(|| BrandflowError::RunNotFound(run_id.to_string()))
    }

    /// Requests cancellation. Returns false if the run is unknown or has
    /// already finished.
    pub fn cancel(&self, run_id: &str, reason: &str) -> bool {
        match self.active.get(run_id) {
            Some(active) if !active.handle.is_finished() => {
                active.cancel.cancel(reason);
                info!(run_id, reason, "Run cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Waits for a submitted run and returns its terminal record.
    ///
    /// The run stops being tracked once waited on. A run that already
    /// finished and was pruned is read back from the state store.
    pub async fn wait(&self, run_id: &str) -> Result<Run, BrandflowError> {
        let Some((_, active)) = self.active.remove(run_id) else {
            return self.status(run_id).await;
        };
        active
            .handle
            .await
            .map_err(|e| BrandflowError::Task(e.to_string()))
    }

    /// Stops tracking runs whose task has finished. Returns how many were
    /// dropped.
    pub fn prune_finished(&self) -> usize {
        let before = self.active.len();
        self.active.retain(|_, active| !active.handle.is_finished());
        let pruned = before.saturating_sub(self.active.len());
        if pruned > 0 {
            debug!(pruned, "Pruned finished runs");
        }
        pruned
    }

    /// Number of runs currently tracked, finished or not.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.active.len()
    }

    /// Number of submitted runs whose task has not finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| !entry.value().handle.is_finished())
            .count()
    }
}
