//! In-memory state store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{StageStatusUpdate, StateStore};
use crate::core::Run;
use crate::errors::{ErrorPayload, Failure};

#[derive(Debug, Default)]
struct Records {
    runs: HashMap<String, Run>,
    updates: Vec<StageStatusUpdate>,
    failures: Vec<ErrorPayload>,
}

/// State store kept in process memory.
///
/// Stage updates are folded into the stored run so status queries see the
/// latest stage records, and the raw update log is kept for inspection.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    records: Arc<Mutex<Records>>,
}

impl InMemoryStateStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().runs.len()
    }

    /// Returns true if no run has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().runs.is_empty()
    }

    /// The stored run record.
    #[must_use]
    pub fn run(&self, run_id: &str) -> Option<Run> {
        self.records.lock().runs.get(run_id).cloned()
    }

    /// Stage updates in the order they were received.
    #[must_use]
    pub fn updates(&self) -> Vec<StageStatusUpdate> {
        self.records.lock().updates.clone()
    }

    /// Stage updates received for one run.
    #[must_use]
    pub fn updates_for(&self, run_id: &str) -> Vec<StageStatusUpdate> {
        self.records
            .lock()
            .updates
            .iter()
            .filter(|u| u.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Failure payloads received.
    #[must_use]
    pub fn failures(&self) -> Vec<ErrorPayload> {
        self.records.lock().failures.clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn report_run(&self, run: &Run) -> Result<(), Failure> {
        self.records.lock().runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn report_stage_status(&self, update: &StageStatusUpdate) -> Result<(), Failure> {
        let mut records = self.records.lock();
        if let Some(stage) = records
            .runs
            .get_mut(&update.run_id)
            .and_then(|run| {
                run.stages
                    .iter_mut()
                    .find(|s| s.stage_number == update.stage_number)
            })
        {
            stage.status = update.status;
            if update.output.is_some() {
                stage.output.clone_from(&update.output);
            }
            if update.error_code.is_some() {
                stage.error_code = update.error_code;
            }
            if update.completed_at.is_some() {
                stage.completed_at = update.completed_at;
            }
        }
        records.updates.push(update.clone());
        Ok(())
    }

    async fn report_failure(&self, payload: &ErrorPayload) -> Result<(), Failure> {
        self.records.lock().failures.push(payload.clone());
        Ok(())
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<Run>, Failure> {
        Ok(self.records.lock().runs.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_and_fetch_run() {
        let store = InMemoryStateStore::new();
        assert!(store.is_empty());

        let run = Run::new("run-1", "doc", "brand");
        store.report_run(&run).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch_run("run-1").await.unwrap(), Some(run));
        assert_eq!(store.fetch_run("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stage_update_folds_into_run() {
        let store = InMemoryStateStore::new();
        store
            .report_run(&Run::new("run-1", "doc", "brand"))
            .await
            .unwrap();

        let update = StageStatusUpdate {
            run_id: "run-1".to_string(),
            stage_number: 2,
            stage_name: "Signal Amplification".to_string(),
            status: StageStatus::Complete,
            output: Some(json!({"x": 1})),
            error_code: None,
            completed_at: None,
        };
        store.report_stage_status(&update).await.unwrap();

        let run = store.fetch_run("run-1").await.unwrap().unwrap();
        let stage = run.stage(2).unwrap();
        assert_eq!(stage.status, StageStatus::Complete);
        assert_eq!(stage.output, Some(json!({"x": 1})));
        assert_eq!(store.updates_for("run-1").len(), 1);
        assert!(store.updates_for("other").is_empty());
    }
}
