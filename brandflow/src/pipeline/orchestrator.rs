//! Run state machine driving the five stages for one (input, brand) pair.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::definition::{BrandContext, PipelineDefinition, StageDescriptor, StageInputs};
use super::prefix_cache::{PrefixCache, PrefixError};
use super::repair::{JsonRepair, OutputRepair};
use super::reporter::StatusReporter;
use super::retry::{execute_with_retry, with_timeout, RetryPolicy};
use super::runner::{StageOutput, StageRunner};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::Run;
use crate::errors::{classify, ErrorRecord, Failure, TransitionError};
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::WideEventEmitter;
use crate::ports::{
    CompletionNotifier, CompletionPayload, DocumentExtractor, GenerationProvider,
    PlainSummaryRenderer, ProfileLoader, ReportRenderer, StageStatusUpdate, StateStore,
};

/// Request to execute the pipeline for one (input, brand) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Source document identifier.
    pub input_id: String,
    /// Brand identifier.
    pub brand_id: String,
    /// Caller-supplied run identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl RunRequest {
    /// Creates a request with a generated run id.
    #[must_use]
    pub fn new(input_id: impl Into<String>, brand_id: impl Into<String>) -> Self {
        Self {
            input_id: input_id.into(),
            brand_id: brand_id.into(),
            run_id: None,
        }
    }

    /// Sets the run id.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// The supplied run id, or a fresh UUID.
    #[must_use]
    pub fn resolve_run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }
}

/// External collaborators a pipeline needs.
#[derive(Clone)]
pub struct Collaborators {
    /// Generation provider.
    pub provider: Arc<dyn GenerationProvider>,
    /// Document extractor.
    pub extractor: Arc<dyn DocumentExtractor>,
    /// Brand profile loader.
    pub profiles: Arc<dyn ProfileLoader>,
    /// State store.
    pub store: Arc<dyn StateStore>,
    /// Completion notifier.
    pub notifier: Arc<dyn CompletionNotifier>,
}

fn invariant(err: &TransitionError, stage: u8) -> ErrorRecord {
    classify(&Failure::logic(err.to_string()), stage)
}

fn checkpoint(cancel: &CancellationToken, stage: u8) -> Result<(), ErrorRecord> {
    if cancel.is_cancelled() {
        return Err(ErrorRecord::cancelled(
            stage,
            cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
        ));
    }
    Ok(())
}

/// Owns the run state machine.
///
/// `RUNNING(stage 1..5) -> COMPLETE | FAILED`. Stage status is reported
/// after every transition and reporting failures never change the outcome.
pub struct Orchestrator {
    definition: Arc<PipelineDefinition>,
    runner: StageRunner,
    reporter: StatusReporter,
    extractor: Arc<dyn DocumentExtractor>,
    profiles: Arc<dyn ProfileLoader>,
    notifier: Arc<dyn CompletionNotifier>,
    renderer: Arc<dyn ReportRenderer>,
    events: Arc<dyn EventSink>,
    summary: WideEventEmitter,
    notify_policy: RetryPolicy,
    notify_timeout: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runner", &self.runner)
            .field("reporter", &self.reporter)
            .field("notify_policy", &self.notify_policy)
            .field("notify_timeout", &self.notify_timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator for the standard pipeline.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: &PipelineConfig) -> Self {
        let repairer: Arc<dyn OutputRepair> = Arc::new(JsonRepair::new());
        let events: Arc<dyn EventSink> = Arc::new(NoOpEventSink);
        Self {
            definition: Arc::new(PipelineDefinition::standard()),
            runner: StageRunner::new(collaborators.provider, repairer)
                .with_policy(config.stage_retry.clone())
                .with_provider_timeout(config.provider_timeout())
                .with_event_sink(events.clone()),
            reporter: StatusReporter::new(
                collaborators.store,
                config.status_retry.clone(),
                config.store_timeout(),
            ),
            extractor: collaborators.extractor,
            profiles: collaborators.profiles,
            notifier: collaborators.notifier,
            renderer: Arc::new(PlainSummaryRenderer),
            events,
            summary: WideEventEmitter::new(),
            notify_policy: config.notify_retry.clone(),
            notify_timeout: config.notify_timeout(),
        }
    }

    /// Replaces the output repairer.
    #[must_use]
    pub fn with_repair(mut self, repairer: Arc<dyn OutputRepair>) -> Self {
        self.runner = self.runner.with_repairer(repairer);
        self
    }

    /// Replaces the report renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Sets the event sink for run and stage events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.runner = self.runner.with_event_sink(events.clone());
        self.events = events;
        self
    }

    /// The status reporter, shared with status queries.
    #[must_use]
    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// The pipeline definition.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Executes one run to a terminal state and returns it.
    ///
    /// The input-only prefix comes from `cache`; pass a fresh cache for a
    /// standalone run.
    pub async fn execute(
        &self,
        request: RunRequest,
        cache: &PrefixCache,
        cancel: &CancellationToken,
    ) -> Run {
        let run_id = request.resolve_run_id();
        let span = info_span!(
            "pipeline_run",
            run_id = %run_id,
            input_id = %request.input_id,
            brand_id = %request.brand_id
        );
        self.execute_inner(Run::new(run_id, request.input_id, request.brand_id), cache, cancel)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        mut run: Run,
        cache: &PrefixCache,
        cancel: &CancellationToken,
    ) -> Run {
        info!("Pipeline run started");
        let events = Arc::clone(&self.events);
        let cancelled_run = run.run_id.clone();
        cancel.on_cancel(move || {
            info!(run_id = %cancelled_run, "Run saw cancellation request");
            events.try_emit("run.cancel_requested", Some(json!({"run_id": cancelled_run})));
        });
        self.reporter.run(&run, cancel).await;
        self.events.try_emit(
            "run.started",
            Some(json!({
                "run_id": run.run_id,
                "input_id": run.input_id,
                "brand_id": run.brand_id,
            })),
        );

        match self.drive(&mut run, cache, cancel).await {
            Ok(()) => self.finish(&mut run).await,
            Err(record) => self.abort(&mut run, record).await,
        }
        self.summary.emit_run(self.events.as_ref(), &run);
        run
    }

    async fn drive(
        &self,
        run: &mut Run,
        cache: &PrefixCache,
        cancel: &CancellationToken,
    ) -> Result<(), ErrorRecord> {
        let input_id = run.input_id.clone();
        let lookup = cache
            .get_or_compute_prefix(&input_id, cancel, || self.compute_prefix(&mut *run, cancel))
            .await;

        let entry = match lookup {
            Ok(lookup) => {
                if !lookup.computed_here {
                    self.apply_cached_prefix(run, &lookup.entry.prefix_outputs, cancel)
                        .await?;
                }
                self.events.try_emit(
                    if lookup.computed_here { "prefix.computed" } else { "prefix.cache_hit" },
                    Some(json!({
                        "run_id": run.run_id,
                        "input_id": input_id,
                        "digest": lookup.entry.digest(),
                    })),
                );
                lookup.entry
            }
            Err(PrefixError::Shared {
                failure,
                computed_here,
            }) => {
                if computed_here {
                    return Err(failure.record);
                }
                let record = failure.record.with_note("shared prefix failed");
                self.mark_failed(run, &record).await;
                return Err(record);
            }
            Err(PrefixError::Cancelled(record)) => return Err(record),
        };

        let mut inputs = StageInputs::for_document(input_id, String::new());
        for output in &entry.prefix_outputs {
            inputs.record(output.stage, output.value.clone());
        }

        let Some(first) = self.definition.brand_stages().first() else {
            return Ok(());
        };
        checkpoint(cancel, first.number)?;
        self.advance(run, first.number, cancel).await?;
        let brand = match self.load_brand(&run.brand_id, first.number).await {
            Ok(brand) => brand,
            Err(record) => {
                self.mark_failed(run, &record).await;
                return Err(record);
            }
        };
        let inputs = inputs.with_brand(brand);
        self.run_stages(run, self.definition.brand_stages(), inputs, cancel)
            .await?;
        Ok(())
    }

    async fn compute_prefix(
        &self,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> Result<Vec<StageOutput>, ErrorRecord> {
        let first = self.definition.prefix().first().map_or(1, |s| s.number);
        checkpoint(cancel, first)?;

        let text = match self.extractor.extract_text(&run.input_id).await {
            Ok(text) => text,
            Err(failure) => {
                let record = classify(&failure, first);
                self.mark_failed(run, &record).await;
                return Err(record);
            }
        };
        let inputs = StageInputs::for_document(run.input_id.clone(), text);
        self.run_stages(run, self.definition.prefix(), inputs, cancel)
            .await
    }

    async fn run_stages(
        &self,
        run: &mut Run,
        stages: &[StageDescriptor],
        mut inputs: StageInputs,
        cancel: &CancellationToken,
    ) -> Result<Vec<StageOutput>, ErrorRecord> {
        let run_id = run.run_id.clone();
        let mut outputs = Vec::new();

        for descriptor in stages {
            let stage = descriptor.number;
            checkpoint(cancel, stage)?;
            self.advance(run, stage, cancel).await?;
            let execution = run.stage_mut(stage).map_err(|e| invariant(&e, stage))?;

            let output = self
                .runner
                .run(&run_id, descriptor, &inputs, execution, &self.reporter, cancel)
                .await?;
            inputs.record(stage, output.value.clone());
            outputs.push(output);
        }
        Ok(outputs)
    }

    async fn apply_cached_prefix(
        &self,
        run: &mut Run,
        outputs: &[StageOutput],
        cancel: &CancellationToken,
    ) -> Result<(), ErrorRecord> {
        let run_id = run.run_id.clone();
        for output in outputs {
            let stage = output.stage;
            self.advance(run, stage, cancel).await?;
            let execution = run.stage_mut(stage).map_err(|e| invariant(&e, stage))?;
            execution
                .complete_from_cache(output.value.clone())
                .map_err(|e| invariant(&e, stage))?;
            execution.attempts = output.attempts;
            execution.repaired = output.repaired;

            let update =
                StageStatusUpdate::from_stage(&run_id, self.definition.stage_name(stage), execution);
            self.reporter.stage(&update, cancel).await;
        }
        Ok(())
    }

    /// Moves the run to `stage`, reporting the run record when the stage
    /// actually changed so status queries see the completed stages.
    async fn advance(
        &self,
        run: &mut Run,
        stage: u8,
        cancel: &CancellationToken,
    ) -> Result<(), ErrorRecord> {
        let previous = run.current_stage;
        run.advance_to(stage).map_err(|e| invariant(&e, stage))?;
        if run.current_stage != previous {
            self.reporter.run(run, cancel).await;
        }
        Ok(())
    }

    async fn load_brand(&self, brand_id: &str, stage: u8) -> Result<BrandContext, ErrorRecord> {
        let profile = self
            .profiles
            .load_brand_profile(brand_id)
            .await
            .map_err(|f| classify(&f, stage))?;

        let research = match self.profiles.load_research(brand_id).await {
            Ok(Some(research)) => research,
            Ok(None) => {
                warn!(brand_id, "No research available, continuing without it");
                String::new()
            }
            Err(failure) => {
                warn!(brand_id, error = %failure, "Research could not be loaded, continuing without it");
                String::new()
            }
        };

        Ok(BrandContext {
            brand_id: brand_id.to_string(),
            profile,
            research,
        })
    }

    /// Marks a stage that never reached the provider as FAILED and reports it.
    async fn mark_failed(&self, run: &mut Run, record: &ErrorRecord) {
        let stage = record.stage;
        let run_id = run.run_id.clone();
        if let Err(e) = run.advance_to(stage) {
            warn!(stage, error = %e, "Run could not advance to the failed stage");
        }
        let Ok(execution) = run.stage_mut(stage) else {
            return;
        };
        if execution.fail(record.code, 0).is_err() {
            return;
        }
        let update =
            StageStatusUpdate::from_stage(&run_id, self.definition.stage_name(stage), execution);
        self.reporter.stage(&update, &CancellationToken::new()).await;
    }

    async fn finish(&self, run: &mut Run) {
        let detached = CancellationToken::new();
        if let Err(e) = run.complete() {
            warn!(error = %e, "Run could not be completed");
            return;
        }
        self.reporter.run(run, &detached).await;
        self.events.try_emit(
            "run.completed",
            Some(json!({"run_id": run.run_id, "duration_ms": run.duration_ms()})),
        );
        info!(duration_ms = run.duration_ms(), "Pipeline run complete");

        let payload = CompletionPayload::from_run(run, self.renderer.render(run));
        let limit = self.notify_timeout;
        let notified = execute_with_retry(&self.notify_policy, run.current_stage, &detached, |_| {
            with_timeout(limit, "completion notification", self.notifier.notify_complete(&payload))
        })
        .await;

        if let Err(e) = notified {
            warn!(
                code = %e.record().code,
                attempts = e.attempts(),
                error = %e,
                "Completion notification abandoned"
            );
            self.events.try_emit(
                "run.notify_failed",
                Some(json!({"run_id": run.run_id, "code": e.record().code})),
            );
        }
    }

    async fn abort(&self, run: &mut Run, record: ErrorRecord) {
        let detached = CancellationToken::new();
        let payload = record.to_payload(&run.run_id);
        warn!(
            stage = record.stage,
            code = %record.code,
            can_retry = record.can_retry,
            error = %record.raw_message,
            "Pipeline run failed"
        );
        if let Err(e) = run.fail(record) {
            warn!(error = %e, "Run could not be marked failed");
            return;
        }
        self.reporter.run(run, &detached).await;
        self.reporter.failure(&payload, &detached).await;
        self.events.try_emit(
            "run.failed",
            Some(json!({
                "run_id": run.run_id,
                "stage": payload.error.stage,
                "code": payload.error.code,
                "can_retry": payload.error.can_retry,
            })),
        );
    }
}
