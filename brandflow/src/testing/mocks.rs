//! Scripted collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::fixtures::{opportunities_json, stage_json};
use crate::core::Run;
use crate::errors::{ErrorPayload, Failure};
use crate::pipeline::{OutputRepair, PromptContext, OPPORTUNITY_COUNT};
use crate::ports::{
    BrandProfile, CompletionNotifier, CompletionPayload, DocumentExtractor, GenerationProvider,
    InMemoryStateStore, ProfileLoader, StageStatusUpdate, StateStore,
};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(Failure),
}

/// Generation provider driven by per-stage scripts.
///
/// Each call pops the next queued reply for the stage. With the queue
/// empty it uses the stage fallback, and without one it returns a valid
/// default output for the stage.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    queued: Mutex<HashMap<u8, VecDeque<Reply>>>,
    fallbacks: HashMap<u8, Reply>,
    delay: Option<Duration>,
    calls: Mutex<Vec<PromptContext>>,
}

impl ScriptedProvider {
    /// Creates a provider answering every stage with a valid default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, stage: u8, reply: Reply) -> Self {
        self.queued.lock().entry(stage).or_default().push_back(reply);
        self
    }

    /// Queues a text reply for the next call of `stage`.
    #[must_use]
    pub fn respond(self, stage: u8, text: &str) -> Self {
        self.push(stage, Reply::Text(text.to_string()))
    }

    /// Queues an untagged failure, classified from its message.
    #[must_use]
    pub fn fail(self, stage: u8, message: &str) -> Self {
        self.push(stage, Reply::Fail(Failure::new(message)))
    }

    /// Queues a specific failure.
    #[must_use]
    pub fn fail_with(self, stage: u8, failure: Failure) -> Self {
        self.push(stage, Reply::Fail(failure))
    }

    /// Replies with `text` whenever the queue for `stage` is empty.
    #[must_use]
    pub fn fallback(mut self, stage: u8, text: &str) -> Self {
        self.fallbacks.insert(stage, Reply::Text(text.to_string()));
        self
    }

    /// Fails with `message` whenever the queue for `stage` is empty.
    #[must_use]
    pub fn fallback_failure(mut self, stage: u8, message: &str) -> Self {
        self.fallbacks
            .insert(stage, Reply::Fail(Failure::new(message)));
        self
    }

    /// Sleeps before every reply.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls made for `stage`.
    #[must_use]
    pub fn calls_for(&self, stage: u8) -> usize {
        self.calls.lock().iter().filter(|c| c.stage == stage).count()
    }

    /// Total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Prompt contexts received, in call order.
    #[must_use]
    pub fn contexts(&self) -> Vec<PromptContext> {
        self.calls.lock().clone()
    }

    fn default_reply(stage: u8) -> Reply {
        if stage == 5 {
            Reply::Text(opportunities_json(OPPORTUNITY_COUNT))
        } else {
            Reply::Text(stage_json(stage))
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn generate(&self, context: &PromptContext) -> Result<String, Failure> {
        self.calls.lock().push(context.clone());
        let reply = self
            .queued
            .lock()
            .get_mut(&context.stage)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.fallbacks.get(&context.stage).cloned())
            .unwrap_or_else(|| Self::default_reply(context.stage));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(failure) => Err(failure),
        }
    }
}

/// Wraps an [`OutputRepair`] and counts invocations.
pub struct CountingRepair {
    inner: Box<dyn OutputRepair>,
    calls: AtomicUsize,
}

impl CountingRepair {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: impl OutputRepair + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of repair attempts.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OutputRepair for CountingRepair {
    fn repair(&self, raw: &str) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.repair(raw)
    }
}

/// State store that fails its first `fail_first` calls, then delegates to
/// an [`InMemoryStateStore`].
#[derive(Debug)]
pub struct FlakyStateStore {
    inner: InMemoryStateStore,
    fail_first: usize,
    calls: AtomicUsize,
}

impl FlakyStateStore {
    /// Creates a store failing `fail_first` times. `usize::MAX` never recovers.
    #[must_use]
    pub fn new(inner: InMemoryStateStore, fail_first: usize) -> Self {
        Self {
            inner,
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }

    /// Calls made, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), Failure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            Err(Failure::state_store("state store unavailable (HTTP 503)"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StateStore for FlakyStateStore {
    async fn report_run(&self, run: &Run) -> Result<(), Failure> {
        self.gate()?;
        self.inner.report_run(run).await
    }

    async fn report_stage_status(&self, update: &StageStatusUpdate) -> Result<(), Failure> {
        self.gate()?;
        self.inner.report_stage_status(update).await
    }

    async fn report_failure(&self, payload: &ErrorPayload) -> Result<(), Failure> {
        self.gate()?;
        self.inner.report_failure(payload).await
    }

    async fn fetch_run(&self, run_id: &str) -> Result<Option<Run>, Failure> {
        self.gate()?;
        self.inner.fetch_run(run_id).await
    }
}

/// Completion notifier that records payloads and can fail or stall a
/// number of deliveries first.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    fail_first: usize,
    stall_first: usize,
    stall: Duration,
    calls: AtomicUsize,
    delivered: Mutex<Vec<CompletionPayload>>,
}

impl RecordingNotifier {
    /// A notifier that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier failing its first `n` deliveries with a retryable error.
    #[must_use]
    pub fn failing(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::default()
        }
    }

    /// A notifier whose first `n` deliveries hang for `stall` before
    /// succeeding.
    #[must_use]
    pub fn stalling(n: usize, stall: Duration) -> Self {
        Self {
            stall_first: n,
            stall,
            ..Self::default()
        }
    }

    /// Delivery attempts, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payloads that were accepted.
    #[must_use]
    pub fn delivered(&self) -> Vec<CompletionPayload> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify_complete(&self, payload: &CompletionPayload) -> Result<(), Failure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.stall_first {
            tokio::time::sleep(self.stall).await;
        }
        if n < self.fail_first {
            return Err(Failure::delivery("webhook returned HTTP 502"));
        }
        self.delivered.lock().push(payload.clone());
        Ok(())
    }
}

/// Document extractor backed by a map of input id to text.
#[derive(Debug, Default)]
pub struct StaticDocuments {
    texts: HashMap<String, String>,
    calls: AtomicUsize,
}

impl StaticDocuments {
    /// Creates an extractor with no documents.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a document.
    #[must_use]
    pub fn with(mut self, input_id: &str, text: &str) -> Self {
        self.texts.insert(input_id.to_string(), text.to_string());
        self
    }

    /// Extraction calls made.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentExtractor for StaticDocuments {
    async fn extract_text(&self, input_id: &str) -> Result<String, Failure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.get(input_id).cloned().ok_or_else(|| {
            Failure::input_parse(format!("Failed to extract text from document {input_id}"))
        })
    }
}

/// Profile loader backed by in-memory profiles and research notes.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, BrandProfile>,
    research: HashMap<String, String>,
    broken_research: Vec<String>,
}

impl StaticProfiles {
    /// Creates a loader with no brands.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a brand whose profile only carries a display name.
    #[must_use]
    pub fn with_brand(mut self, brand_id: &str, name: &str) -> Self {
        self.profiles.insert(
            brand_id.to_string(),
            BrandProfile::from_value(serde_json::json!({ "brand_name": name })),
        );
        self
    }

    /// Adds research notes for a brand.
    #[must_use]
    pub fn with_research(mut self, brand_id: &str, notes: &str) -> Self {
        self.research.insert(brand_id.to_string(), notes.to_string());
        self
    }

    /// Makes research loading fail for a brand.
    #[must_use]
    pub fn with_broken_research(mut self, brand_id: &str) -> Self {
        self.broken_research.push(brand_id.to_string());
        self
    }
}

#[async_trait]
impl ProfileLoader for StaticProfiles {
    async fn load_brand_profile(&self, brand_id: &str) -> Result<BrandProfile, Failure> {
        self.profiles
            .get(brand_id)
            .cloned()
            .ok_or_else(|| Failure::logic(format!("Brand {brand_id} not found")))
    }

    async fn load_research(&self, brand_id: &str) -> Result<Option<String>, Failure> {
        if self.broken_research.iter().any(|b| b == brand_id) {
            return Err(Failure::state_store("research bucket unreachable"));
        }
        Ok(self.research.get(brand_id).cloned())
    }
}
