//! Collaborator interfaces consumed by the engine.
//!
//! Everything the engine talks to lives behind one of these traits:
//! document extraction, profile loading, the generation provider, the
//! state store, the completion notifier and the report renderer. All
//! failures are returned as [`Failure`] values and classified by the
//! caller.

mod memory;
mod payloads;

#[cfg(feature = "http")]
pub mod http;

pub use memory::InMemoryStateStore;
pub use payloads::{
    BrandProfile, CompletionPayload, PlainSummaryRenderer, ReportRenderer, StageStatusUpdate,
};

use async_trait::async_trait;

use crate::core::Run;
use crate::errors::{ErrorPayload, Failure};
use crate::pipeline::PromptContext;

/// Extracts text from a source document.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Returns the document text. Malformed sources fail with an input parse failure.
    async fn extract_text(&self, input_id: &str) -> Result<String, Failure>;
}

/// Loads brand configuration.
#[async_trait]
pub trait ProfileLoader: Send + Sync {
    /// Loads the brand profile.
    async fn load_brand_profile(&self, brand_id: &str) -> Result<BrandProfile, Failure>;

    /// Loads research notes. `Ok(None)` means there are none, which is valid.
    async fn load_research(&self, brand_id: &str) -> Result<Option<String>, Failure>;
}

/// The external content-generation service.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Generates raw text for one stage.
    async fn generate(&self, context: &PromptContext) -> Result<String, Failure>;
}

/// External system of record for run and stage status.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upserts the run record.
    async fn report_run(&self, run: &Run) -> Result<(), Failure>;

    /// Records one stage status transition.
    async fn report_stage_status(&self, update: &StageStatusUpdate) -> Result<(), Failure>;

    /// Records the error payload of a failed run.
    async fn report_failure(&self, payload: &ErrorPayload) -> Result<(), Failure>;

    /// Fetches a run with its stage records.
    async fn fetch_run(&self, run_id: &str) -> Result<Option<Run>, Failure>;
}

/// Webhook-style endpoint told about completed runs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// Delivers the completion payload.
    async fn notify_complete(&self, payload: &CompletionPayload) -> Result<(), Failure>;
}
