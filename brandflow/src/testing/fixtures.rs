//! Fixtures: canned outputs, fast configuration and a wired harness.

use serde_json::json;
use std::sync::Arc;

use super::mocks::{FlakyStateStore, RecordingNotifier, ScriptedProvider, StaticDocuments, StaticProfiles};
use crate::config::PipelineConfig;
use crate::events::CollectingEventSink;
use crate::pipeline::{Collaborators, Orchestrator, RetryPolicy};
use crate::ports::{CompletionNotifier, InMemoryStateStore, StateStore};

/// A valid object output for stages 1 to 4.
#[must_use]
pub fn stage_json(stage: u8) -> String {
    json!({
        "stage": stage,
        "summary": format!("stage {stage} summary"),
        "signals": ["retail footfall is shifting to evenings"],
    })
    .to_string()
}

/// A stage 5 output holding `count` opportunities.
#[must_use]
pub fn opportunities_json(count: usize) -> String {
    let opportunities: Vec<_> = (1..=count)
        .map(|i| {
            json!({
                "title": format!("Opportunity {i}"),
                "description": format!("Idea number {i}"),
            })
        })
        .collect();
    json!({ "opportunities": opportunities }).to_string()
}

/// Default configuration with zero-delay retries, so tests never sleep
/// between attempts unless they opt in.
#[must_use]
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        status_retry: RetryPolicy::immediate(3),
        notify_retry: RetryPolicy::immediate(3),
        stage_retry: RetryPolicy::immediate(2),
        provider_timeout_secs: 5,
        notify_timeout_secs: 5,
        store_timeout_secs: 5,
        ..PipelineConfig::default()
    }
}

/// Scripted collaborators wired into an orchestrator.
///
/// Knows documents `doc-1` and `doc-2` and brands `brand-a`, `brand-b`
/// and `brand-c`.
pub struct TestHarness {
    /// Generation provider.
    pub provider: Arc<ScriptedProvider>,
    /// Document extractor.
    pub documents: Arc<StaticDocuments>,
    /// Profile loader.
    pub profiles: Arc<StaticProfiles>,
    /// Records written by the store, whichever wrapper is installed.
    pub records: InMemoryStateStore,
    /// Store handed to the orchestrator.
    pub store: Arc<dyn StateStore>,
    /// Completion notifier.
    pub notifier: Arc<dyn CompletionNotifier>,
    /// Every event the orchestrator emitted.
    pub events: Arc<CollectingEventSink>,
    /// Configuration used to build the orchestrator.
    pub config: PipelineConfig,
}

impl TestHarness {
    /// Creates a harness around `provider`.
    #[must_use]
    pub fn new(provider: ScriptedProvider) -> Self {
        let records = InMemoryStateStore::new();
        Self {
            provider: Arc::new(provider),
            documents: Arc::new(
                StaticDocuments::new()
                    .with("doc-1", "Quarterly consumer trends report")
                    .with("doc-2", "Gen Z travel behaviour study"),
            ),
            profiles: Arc::new(
                StaticProfiles::new()
                    .with_brand("brand-a", "Acme")
                    .with_research("brand-a", "Acme sells outdoor gear")
                    .with_brand("brand-b", "Birch")
                    .with_brand("brand-c", "Cobalt"),
            ),
            store: Arc::new(records.clone()),
            records,
            notifier: Arc::new(RecordingNotifier::new()),
            events: Arc::new(CollectingEventSink::new()),
            config: fast_config(),
        }
    }

    /// Replaces the document extractor.
    #[must_use]
    pub fn with_documents(mut self, documents: StaticDocuments) -> Self {
        self.documents = Arc::new(documents);
        self
    }

    /// Replaces the profile loader.
    #[must_use]
    pub fn with_profiles(mut self, profiles: StaticProfiles) -> Self {
        self.profiles = Arc::new(profiles);
        self
    }

    /// Replaces the notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Puts a store failing its first `fail_first` calls in front of the records.
    #[must_use]
    pub fn with_flaky_store(mut self, fail_first: usize) -> Self {
        self.store = Arc::new(FlakyStateStore::new(self.records.clone(), fail_first));
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Collaborators for a new orchestrator.
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            extractor: self.documents.clone(),
            profiles: self.profiles.clone(),
            store: self.store.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Builds an orchestrator emitting into [`TestHarness::events`].
    #[must_use]
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.collaborators(), &self.config).with_event_sink(self.events.clone())
    }
}
