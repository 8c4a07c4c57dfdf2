//! Generic executor for one pipeline stage.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::definition::{StageDescriptor, StageInputs};
use super::repair::{parse_strict, OutputRepair};
use super::reporter::StatusReporter;
use super::retry::{execute_with_retry, with_timeout, RetryError, RetryPolicy};
use crate::cancellation::CancellationToken;
use crate::core::StageExecution;
use crate::errors::{classify, ErrorCode, ErrorRecord, Failure, FailureTag};
use crate::events::{EventSink, NoOpEventSink};
use crate::ports::{GenerationProvider, StageStatusUpdate};

/// Accepted output of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage number.
    pub stage: u8,
    /// Parsed and validated output.
    pub value: Value,
    /// Text the provider returned for the accepted attempt.
    pub raw_text: String,
    /// Whether repair was needed.
    pub repaired: bool,
    /// Provider attempts used.
    pub attempts: u32,
}

/// Runs stage descriptors against the generation provider.
///
/// Each provider attempt is: build the prompt context, call the provider
/// under a per-call timeout, strictly parse, repair once if parsing failed,
/// then validate the shape. A failed attempt is retried as a whole.
#[derive(Clone)]
pub struct StageRunner {
    provider: Arc<dyn GenerationProvider>,
    repairer: Arc<dyn OutputRepair>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
    provider_timeout: Duration,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("policy", &self.policy)
            .field("provider_timeout", &self.provider_timeout)
            .finish_non_exhaustive()
    }
}

/// Keeps a provider failure within `RATE_LIMIT`, `PROVIDER_ERROR` or
/// `TIMEOUT`. Anything else the provider reports is re-tagged as a provider
/// failure so the stage policy still retries it.
fn provider_failure(failure: Failure, stage: u8) -> Failure {
    match classify(&failure, stage).code {
        ErrorCode::RateLimit | ErrorCode::ProviderError | ErrorCode::Timeout => failure,
        _ => failure.with_tag(FailureTag::Provider),
    }
}

impl StageRunner {
    /// Creates a runner with the stage retry policy and a 120s provider timeout.
    #[must_use]
    pub fn new(provider: Arc<dyn GenerationProvider>, repairer: Arc<dyn OutputRepair>) -> Self {
        Self {
            provider,
            repairer,
            events: Arc::new(NoOpEventSink),
            policy: RetryPolicy::stage_default(),
            provider_timeout: Duration::from_secs(120),
        }
    }

    /// Sets the retry policy for whole provider calls.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the per-call provider timeout.
    #[must_use]
    pub const fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Replaces the output repairer.
    #[must_use]
    pub fn with_repairer(mut self, repairer: Arc<dyn OutputRepair>) -> Self {
        self.repairer = repairer;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    fn accept(&self, descriptor: &StageDescriptor, raw: &str) -> Result<(Value, bool), Failure> {
        match parse_strict(raw) {
            Ok(value) => {
                descriptor.shape.validate(&value)?;
                Ok((value, false))
            }
            Err(parse_err) => {
                debug!(stage = descriptor.number, error = %parse_err, "Strict parse failed, attempting repair");
                let repaired = self.repairer.repair(raw).ok_or_else(|| {
                    Failure::malformed_output(format!(
                        "output is not valid JSON and could not be repaired: {parse_err}"
                    ))
                })?;
                let value = parse_strict(&repaired)?;
                descriptor.shape.validate(&value)?;
                Ok((value, true))
            }
        }
    }

    /// Produces a validated output for one stage without touching any run state.
    pub async fn produce(
        &self,
        descriptor: &StageDescriptor,
        inputs: &StageInputs,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, RetryError> {
        execute_with_retry(&self.policy, descriptor.number, cancel, |attempt| async move {
            let context = descriptor.prompt_context(inputs)?;
            let call = with_timeout(
                self.provider_timeout,
                "generation provider call",
                self.provider.generate(&context),
            );
            let raw = tokio::select! {
                result = call => result.map_err(|e| provider_failure(e, descriptor.number))?,
                () = cancel.cancelled() => {
                    return Err(Failure::cancelled(
                        cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                    ));
                }
            };

            let (value, repaired) = self.accept(descriptor, &raw).inspect_err(|e| {
                warn!(stage = descriptor.number, attempt, error = %e, "Stage output rejected");
            })?;
            Ok(StageOutput {
                stage: descriptor.number,
                value,
                raw_text: raw,
                repaired,
                attempts: attempt,
            })
        })
        .await
    }

    /// Executes one stage and records the outcome on its [`StageExecution`].
    ///
    /// The record moves `PENDING -> PROCESSING -> COMPLETE | FAILED` and each
    /// transition is reported before this returns. A FAILED report is sent
    /// even when the run was cancelled.
    pub async fn run(
        &self,
        run_id: &str,
        descriptor: &StageDescriptor,
        inputs: &StageInputs,
        execution: &mut StageExecution,
        reporter: &StatusReporter,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, ErrorRecord> {
        let stage = descriptor.number;
        let logic = |e: &dyn std::fmt::Display| classify(&Failure::logic(e.to_string()), stage);

        execution.begin().map_err(|e| logic(&e))?;
        reporter
            .stage(
                &StageStatusUpdate::from_stage(run_id, descriptor.name, execution),
                cancel,
            )
            .await;
        self.events.try_emit(
            "stage.started",
            Some(json!({"run_id": run_id, "stage": stage, "name": descriptor.name})),
        );

        match self.produce(descriptor, inputs, cancel).await {
            Ok(output) => {
                execution
                    .complete(output.value.clone(), output.attempts, output.repaired)
                    .map_err(|e| logic(&e))?;
                reporter
                    .stage(
                        &StageStatusUpdate::from_stage(run_id, descriptor.name, execution),
                        cancel,
                    )
                    .await;
                if output.repaired {
                    self.events.try_emit(
                        "stage.repaired",
                        Some(json!({"run_id": run_id, "stage": stage})),
                    );
                }
                self.events.try_emit(
                    "stage.completed",
                    Some(json!({
                        "run_id": run_id,
                        "stage": stage,
                        "attempts": output.attempts,
                        "repaired": output.repaired,
                    })),
                );
                info!(run_id, stage, attempts = output.attempts, repaired = output.repaired, "Stage complete");
                Ok(output)
            }
            Err(e) => {
                let attempts = e.attempts();
                let record = e.into_record();
                execution
                    .fail(record.code, attempts)
                    .map_err(|e| logic(&e))?;
                reporter
                    .stage(
                        &StageStatusUpdate::from_stage(run_id, descriptor.name, execution),
                        &CancellationToken::new(),
                    )
                    .await;
                self.events.try_emit(
                    "stage.failed",
                    Some(json!({
                        "run_id": run_id,
                        "stage": stage,
                        "code": record.code,
                        "attempts": attempts,
                    })),
                );
                warn!(run_id, stage, code = %record.code, attempts, "Stage failed");
                Err(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::pipeline::{JsonRepair, PipelineDefinition};
    use crate::ports::InMemoryStateStore;
    use crate::testing::{opportunities_json, CountingRepair, ScriptedProvider};
    use pretty_assertions::assert_eq;

    fn runner(provider: ScriptedProvider) -> (StageRunner, Arc<ScriptedProvider>, Arc<CountingRepair>) {
        let provider = Arc::new(provider);
        let repair = Arc::new(CountingRepair::new(JsonRepair::new()));
        let runner = StageRunner::new(provider.clone(), repair.clone())
            .with_policy(RetryPolicy::immediate(2));
        (runner, provider, repair)
    }

    fn inputs() -> StageInputs {
        StageInputs::for_document("doc-1", "Report text")
    }

    #[tokio::test]
    async fn test_valid_output_skips_repair() {
        let (runner, provider, repair) = runner(ScriptedProvider::new().respond(1, r#"{"a": 1}"#));
        let def = PipelineDefinition::standard();

        let out = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.value, json!({"a": 1}));
        assert!(!out.repaired);
        assert_eq!(out.attempts, 1);
        assert_eq!(repair.calls(), 0);
        assert_eq!(provider.calls_for(1), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_repaired_once() {
        let (runner, _, repair) =
            runner(ScriptedProvider::new().respond(1, "```json\n{\"a\": [1, 2,]}\n```"));
        let def = PipelineDefinition::standard();

        let out = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.value, json!({"a": [1, 2]}));
        assert!(out.repaired);
        assert_eq!(repair.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrepairable_output_retries_provider_call() {
        let provider = ScriptedProvider::new()
            .respond(1, "total garbage")
            .respond(1, r#"{"ok": true}"#);
        let (runner, provider, repair) = runner(provider);
        let def = PipelineDefinition::standard();

        let out = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.attempts, 2);
        assert_eq!(provider.calls_for(1), 2);
        assert_eq!(repair.calls(), 1);
    }

    #[tokio::test]
    async fn test_wrong_opportunity_count_fails_after_two_attempts() {
        let def = PipelineDefinition::standard();
        let mut inputs = inputs().with_brand(crate::pipeline::BrandContext::default());
        inputs.record(4, json!({"brand": "ctx"}));
        let provider = ScriptedProvider::new().fallback(5, &opportunities_json(3));
        let (runner, provider, _) = runner(provider);

        let err = runner
            .produce(&def.stages()[4], &inputs, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 2);
        assert_eq!(err.record().code, ErrorCode::ProviderError);
        assert!(err.record().raw_message.contains("exactly 5"));
        assert_eq!(provider.calls_for(5), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_timeout_counts_as_attempt() {
        let provider = ScriptedProvider::new()
            .delay(Duration::from_secs(30))
            .fallback(1, r#"{"late": true}"#);
        let (runner, provider, _) = runner(provider);
        let runner = runner.with_provider_timeout(Duration::from_secs(5));
        let def = PipelineDefinition::standard();

        let err = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.record().code, ErrorCode::Timeout);
        assert_eq!(err.attempts(), 2);
        assert_eq!(provider.calls_for(1), 2);
    }

    #[tokio::test]
    async fn test_run_records_transitions() {
        let (runner, _, _) = runner(ScriptedProvider::new().respond(1, r#"{"a": 1}"#));
        let def = PipelineDefinition::standard();
        let store = Arc::new(InMemoryStateStore::new());
        let reporter = StatusReporter::new(store.clone(), RetryPolicy::immediate(3), Duration::from_secs(1));
        let mut execution = StageExecution::new(1);

        runner
            .run("run-1", &def.stages()[0], &inputs(), &mut execution, &reporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(execution.status, StageStatus::Complete);
        let statuses: Vec<_> = store.updates().iter().map(|u| u.status).collect();
        assert_eq!(statuses, vec![StageStatus::Processing, StageStatus::Complete]);
    }

    #[tokio::test]
    async fn test_untagged_provider_failure_is_retried() {
        let provider = ScriptedProvider::new()
            .fail(1, "upstream returned HTTP 503 Service Unavailable")
            .respond(1, r#"{"ok": true}"#);
        let (runner, provider, _) = runner(provider);
        let def = PipelineDefinition::standard();

        let out = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.value, json!({"ok": true}));
        assert_eq!(out.attempts, 2);
        assert_eq!(provider.calls_for(1), 2);
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_rate_limit_code() {
        let provider = ScriptedProvider::new().fallback_failure(1, "429 Too Many Requests");
        let (runner, _, _) = runner(provider);
        let def = PipelineDefinition::standard();

        let err = runner
            .produce(&def.stages()[0], &inputs(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.record().code, ErrorCode::RateLimit);
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn test_run_marks_failure() {
        let provider = ScriptedProvider::new().fallback_failure(1, "Failed to extract text from PDF");
        let (runner, provider, _) = runner(provider);
        let def = PipelineDefinition::standard();
        let store = Arc::new(InMemoryStateStore::new());
        let reporter = StatusReporter::new(store.clone(), RetryPolicy::immediate(3), Duration::from_secs(1));
        let mut execution = StageExecution::new(1);

        let record = runner
            .run("run-1", &def.stages()[0], &inputs(), &mut execution, &reporter, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(record.code, ErrorCode::ProviderError);
        assert!(record.can_retry);
        assert_eq!(execution.status, StageStatus::Failed);
        assert_eq!(execution.error_code, Some(ErrorCode::ProviderError));
        assert_eq!(execution.attempts, 2);
        assert_eq!(provider.calls_for(1), 2);
        assert_eq!(store.updates().last().map(|u| u.status), Some(StageStatus::Failed));
    }
}
