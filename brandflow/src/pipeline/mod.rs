//! The five-stage brand pipeline.
//!
//! This module provides:
//! - Retry with exponential backoff and per-call timeouts
//! - Rule-based repair of malformed provider output
//! - Stage descriptors and the generic stage runner
//! - The run state machine and status reporting
//! - The per-input prefix cache and batch execution

mod batch;
mod definition;
mod orchestrator;
mod prefix_cache;
mod repair;
mod reporter;
mod retry;
mod runner;


pub use batch::{BatchExecutor, BatchReport};
pub use definition::{
    BrandContext, ContextBuilder, OutputShape, PipelineDefinition, PromptContext,
    StageDescriptor, StageInputs, StageScope, OPPORTUNITY_COUNT,
};
pub use orchestrator::{Collaborators, Orchestrator, RunRequest};
pub use prefix_cache::{CacheEntry, PrefixCache, PrefixError, PrefixLookup, SharedPrefixFailure};
pub use repair::{parse_strict, JsonRepair, OutputRepair};
pub use reporter::StatusReporter;
pub use retry::{
    execute_with_retry, with_timeout, JitterStrategy, RetryError, RetryPolicy,
};
pub use runner::{StageOutput, StageRunner};
