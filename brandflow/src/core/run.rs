//! The run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{RunStatus, StageStatus};
use crate::errors::{ErrorCode, ErrorRecord, TransitionError};

/// Number of stages in every run.
pub const STAGE_COUNT: u8 = 5;

/// One stage's state within a run.
///
/// Transitions: `PENDING -> PROCESSING -> COMPLETE | FAILED`, plus
/// `PENDING -> COMPLETE` when the output comes from the prefix cache and
/// `PENDING -> FAILED` when the stage never got to call the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    /// Stage number (1-based).
    pub stage_number: u8,
    /// Current status.
    pub status: StageStatus,
    /// When processing began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Accepted output.
    pub output: Option<serde_json::Value>,
    /// Code of the terminal failure.
    pub error_code: Option<ErrorCode>,
    /// Provider attempts used.
    #[serde(default)]
    pub attempts: u32,
    /// Output came through repair.
    #[serde(default)]
    pub repaired: bool,
    /// Output was reused from the prefix cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl StageExecution {
    /// Creates a pending stage.
    #[must_use]
    pub const fn new(stage_number: u8) -> Self {
        Self {
            stage_number,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error_code: None,
            attempts: 0,
            repaired: false,
            from_cache: false,
        }
    }

    fn guard(&self, allowed: &[StageStatus], to: StageStatus) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError::Stage {
                stage: self.stage_number,
                from: self.status,
                to,
            })
        }
    }

    /// `PENDING -> PROCESSING`.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.guard(&[StageStatus::Pending], StageStatus::Processing)?;
        self.status = StageStatus::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `PROCESSING -> COMPLETE` with the accepted output.
    pub fn complete(
        &mut self,
        output: serde_json::Value,
        attempts: u32,
        repaired: bool,
    ) -> Result<(), TransitionError> {
        self.guard(&[StageStatus::Processing], StageStatus::Complete)?;
        self.status = StageStatus::Complete;
        self.completed_at = Some(Utc::now());
        self.output = Some(output);
        self.attempts = attempts;
        self.repaired = repaired;
        Ok(())
    }

    /// `PENDING -> COMPLETE` using an output computed by another run.
    pub fn complete_from_cache(&mut self, output: serde_json::Value) -> Result<(), TransitionError> {
        self.guard(&[StageStatus::Pending], StageStatus::Complete)?;
        let now = Utc::now();
        self.status = StageStatus::Complete;
        self.started_at = Some(now);
        self.completed_at = Some(now);
        self.output = Some(output);
        self.from_cache = true;
        Ok(())
    }

    /// `PENDING | PROCESSING -> FAILED`.
    pub fn fail(&mut self, code: ErrorCode, attempts: u32) -> Result<(), TransitionError> {
        self.guard(
            &[StageStatus::Pending, StageStatus::Processing],
            StageStatus::Failed,
        )?;
        self.status = StageStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_code = Some(code);
        self.attempts = attempts;
        Ok(())
    }
}

/// One execution of the pipeline for an (input, brand) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier.
    pub run_id: String,
    /// Source document identifier.
    pub input_id: String,
    /// Brand identifier.
    pub brand_id: String,
    /// Overall status.
    pub overall_status: RunStatus,
    /// Stage currently executing (1-based).
    pub current_stage: u8,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal failure, if any.
    pub last_error: Option<ErrorRecord>,
    /// Per-stage records, index `n - 1` holds stage `n`.
    pub stages: Vec<StageExecution>,
}

impl Run {
    /// Creates a running run with every stage pending.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        input_id: impl Into<String>,
        brand_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            input_id: input_id.into(),
            brand_id: brand_id.into(),
            overall_status: RunStatus::Running,
            current_stage: 1,
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
            stages: (1..=STAGE_COUNT).map(StageExecution::new).collect(),
        }
    }

    /// Returns true once the run is COMPLETE or FAILED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::RunTerminal {
                run_id: self.run_id.clone(),
                status: self.overall_status,
            });
        }
        Ok(())
    }

    /// Returns a stage record.
    #[must_use]
    pub fn stage(&self, stage_number: u8) -> Option<&StageExecution> {
        stage_number
            .checked_sub(1)
            .and_then(|i| self.stages.get(usize::from(i)))
    }

    /// Returns a stage record for mutation. Refused once the run is terminal.
    pub fn stage_mut(&mut self, stage_number: u8) -> Result<&mut StageExecution, TransitionError> {
        self.ensure_running()?;
        stage_number
            .checked_sub(1)
            .and_then(|i| self.stages.get_mut(usize::from(i)))
            .ok_or(TransitionError::UnknownStage(stage_number))
    }

    /// Moves the current stage index forward.
    pub fn advance_to(&mut self, stage_number: u8) -> Result<(), TransitionError> {
        self.ensure_running()?;
        if stage_number == 0 || stage_number > STAGE_COUNT {
            return Err(TransitionError::UnknownStage(stage_number));
        }
        if stage_number < self.current_stage {
            return Err(TransitionError::StageRegression {
                current: self.current_stage,
                requested: stage_number,
            });
        }
        self.current_stage = stage_number;
        Ok(())
    }

    /// `RUNNING -> COMPLETE`.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.overall_status = RunStatus::Complete;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `RUNNING -> FAILED` with the classified failure.
    pub fn fail(&mut self, record: ErrorRecord) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.overall_status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(record);
        Ok(())
    }

    /// Completed outputs keyed by stage number.
    #[must_use]
    pub fn stage_outputs(&self) -> BTreeMap<u8, serde_json::Value> {
        self.stages
            .iter()
            .filter_map(|s| s.output.clone().map(|o| (s.stage_number, o)))
            .collect()
    }

    /// Milliseconds between start and completion (or now, while running).
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{classify, Failure};
    use serde_json::json;

    fn run() -> Run {
        Run::new("run-1", "doc-1", "brand-1")
    }

    #[test]
    fn test_new_run_has_five_pending_stages() {
        let run = run();
        assert_eq!(run.overall_status, RunStatus::Running);
        assert_eq!(run.current_stage, 1);
        assert_eq!(run.stages.len(), 5);
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Pending));
        assert_eq!(run.stage(3).map(|s| s.stage_number), Some(3));
        assert!(run.stage(0).is_none());
        assert!(run.stage(6).is_none());
    }

    #[test]
    fn test_stage_lifecycle() {
        let mut stage = StageExecution::new(2);
        stage.begin().unwrap();
        assert_eq!(stage.status, StageStatus::Processing);
        assert!(stage.started_at.is_some());

        stage.complete(json!({"ok": true}), 1, false).unwrap();
        assert_eq!(stage.status, StageStatus::Complete);
        assert_eq!(stage.output, Some(json!({"ok": true})));

        let err = stage.begin().unwrap_err();
        assert!(matches!(err, TransitionError::Stage { stage: 2, .. }));
        assert!(stage.fail(ErrorCode::Unknown, 1).is_err());
    }

    #[test]
    fn test_stage_cannot_complete_without_processing() {
        let mut stage = StageExecution::new(1);
        assert!(stage.complete(json!({}), 1, false).is_err());
        stage.complete_from_cache(json!({"cached": 1})).unwrap();
        assert!(stage.from_cache);
        assert_eq!(stage.status, StageStatus::Complete);
    }

    #[test]
    fn test_current_stage_never_decreases() {
        let mut run = run();
        run.advance_to(3).unwrap();
        let err = run.advance_to(2).unwrap_err();
        assert_eq!(
            err,
            TransitionError::StageRegression {
                current: 3,
                requested: 2
            }
        );
        assert_eq!(run.current_stage, 3);
        run.advance_to(3).unwrap();
        assert!(run.advance_to(6).is_err());
    }

    #[test]
    fn test_terminal_runs_reject_mutation() {
        let mut run = run();
        run.complete().unwrap();
        assert!(run.is_terminal());
        assert!(run.complete().is_err());
        assert!(run.fail(classify(&Failure::new("x"), 1)).is_err());
        assert!(run.advance_to(5).is_err());
        assert!(run.stage_mut(1).is_err());
        assert_eq!(run.overall_status, RunStatus::Complete);

        let mut failed = Run::new("run-2", "doc", "brand");
        failed.fail(classify(&Failure::new("quota"), 2)).unwrap();
        assert!(failed.complete().is_err());
        assert_eq!(failed.overall_status, RunStatus::Failed);
        assert_eq!(
            failed.last_error.as_ref().map(|e| e.code),
            Some(ErrorCode::RateLimit)
        );
    }

    #[test]
    fn test_stage_outputs_only_completed() {
        let mut run = run();
        run.stage_mut(1).unwrap().complete_from_cache(json!("one")).unwrap();
        let outputs = run.stage_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get(&1), Some(&json!("one")));
    }

    #[test]
    fn test_run_serializes_camel_case() {
        let value = serde_json::to_value(run()).unwrap();
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["overallStatus"], "RUNNING");
        assert_eq!(value["stages"][0]["stageNumber"], 1);
        assert_eq!(value["stages"][0]["status"], "PENDING");
    }
}
