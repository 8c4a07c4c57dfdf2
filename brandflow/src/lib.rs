//! # Brandflow
//!
//! Engine for a five-stage brand translation pipeline.
//!
//! A run takes one source document and one brand through five sequential
//! stages, each a call to an external generation provider:
//!
//! - **Input-only prefix** (stages 1 to 3): depends on the document alone
//!   and is cached per input, so a batch computes it once per document
//! - **Brand-specific stages** (4 and 5): run once per brand
//! - **Retry and repair**: transient failures back off exponentially and
//!   near-valid JSON output is repaired before a call is retried
//! - **Classification**: every failure becomes a stable error code with a
//!   retry hint and a user-safe message
//! - **Status reporting**: every transition is pushed to an external state
//!   store, and completion is announced to a notifier
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use brandflow::prelude::*;
//!
//! let orchestrator = Arc::new(Orchestrator::new(collaborators, &PipelineConfig::default()));
//! let report = BatchExecutor::new(orchestrator, 4)
//!     .run_batch(&inputs, &brands, &CancellationToken::new())
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod service;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::core::{Run, RunStatus, StageExecution, StageStatus};
    pub use crate::errors::{
        classify, BrandflowError, ErrorCode, ErrorPayload, ErrorRecord, Failure, FailureTag,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        BatchExecutor, BatchReport, Collaborators, JsonRepair, Orchestrator, OutputRepair,
        PipelineDefinition, PrefixCache, RetryPolicy, RunRequest, StageOutput,
    };
    pub use crate::ports::{
        CompletionNotifier, DocumentExtractor, GenerationProvider, ProfileLoader, StateStore,
    };
    pub use crate::service::{PipelineService, SubmitResponse};
}
