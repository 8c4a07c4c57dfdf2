//! Error types for the brandflow engine.
//!
//! Two layers live here:
//!
//! - [`BrandflowError`], the crate-level error returned by configuration,
//!   definition and query APIs.
//! - [`Failure`], the value every collaborator call returns on error. A
//!   failure is message text plus an optional [`FailureTag`], and is turned
//!   into an [`ErrorRecord`] by [`classify`].

mod classify;

pub use classify::{classify, classify_at, ErrorCode, ErrorDetail, ErrorPayload, ErrorRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{RunStatus, StageStatus};
use crate::pipeline::RetryError;

/// The main error type for brandflow operations.
#[derive(Debug, Error)]
pub enum BrandflowError {
    /// The state store has no record of the run.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// A run with this id is already in flight.
    #[error("Run already submitted: {0}")]
    DuplicateRun(String),

    /// A spawned run task panicked or was aborted.
    #[error("Run task failed: {0}")]
    Task(String),

    /// A run or stage mutation violated the state machine.
    #[error("{0}")]
    InvalidTransition(#[from] TransitionError),

    /// A pipeline definition failed validation.
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collaborator call failed outside of a run.
    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] Failure),

    /// A retried side effect gave up.
    #[error("{0}")]
    Retry(#[from] RetryError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for BrandflowError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Rejected mutation of a [`Run`](crate::core::Run) or
/// [`StageExecution`](crate::core::StageExecution).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The run already reached a terminal status.
    #[error("Run {run_id} is already {status} and cannot change")]
    RunTerminal {
        /// The run identifier.
        run_id: String,
        /// The terminal status.
        status: RunStatus,
    },

    /// The current stage index would move backwards.
    #[error("Stage index cannot move backwards from {current} to {requested}")]
    StageRegression {
        /// Current stage index.
        current: u8,
        /// Requested stage index.
        requested: u8,
    },

    /// The stage number is outside the pipeline.
    #[error("Stage {0} does not exist in this run")]
    UnknownStage(u8),

    /// The stage status change is not allowed.
    #[error("Stage {stage} cannot move from {from} to {to}")]
    Stage {
        /// Stage number.
        stage: u8,
        /// Current status.
        from: StageStatus,
        /// Requested status.
        to: StageStatus,
    },
}

/// Hint attached to a [`Failure`] by the code that produced it.
///
/// When present the tag decides the error code, so collaborators that know
/// exactly what went wrong (an HTTP 429, a per-call timeout) do not depend on
/// keyword matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    /// Source document could not be extracted or parsed.
    InputParse,
    /// Upstream asked us to slow down.
    RateLimited,
    /// Generation provider failed.
    Provider,
    /// Provider answered with output that failed parsing, repair or validation.
    MalformedOutput,
    /// Completion notification channel failed.
    Delivery,
    /// Status store failed.
    StateStore,
    /// A per-call timeout elapsed.
    Timeout,
    /// Deterministic failure that will repeat on retry.
    Logic,
    /// The run was cancelled.
    Cancelled,
}

impl fmt::Display for FailureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputParse => write!(f, "input_parse"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Provider => write!(f, "provider"),
            Self::MalformedOutput => write!(f, "malformed_output"),
            Self::Delivery => write!(f, "delivery"),
            Self::StateStore => write!(f, "state_store"),
            Self::Timeout => write!(f, "timeout"),
            Self::Logic => write!(f, "logic"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Failure {
    /// Raw description of what went wrong.
    pub message: String,
    /// Optional type hint.
    pub tag: Option<FailureTag>,
}

impl Failure {
    /// Creates an untagged failure; classification falls back to keywords.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tag: None,
        }
    }

    /// Creates a tagged failure.
    #[must_use]
    pub fn tagged(tag: FailureTag, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tag: Some(tag),
        }
    }

    /// Sets the tag.
    #[must_use]
    pub fn with_tag(mut self, tag: FailureTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Source document failure.
    #[must_use]
    pub fn input_parse(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::InputParse, message)
    }

    /// Rate limit failure.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::RateLimited, message)
    }

    /// Generation provider failure.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::Provider, message)
    }

    /// Output that could not be parsed or validated.
    #[must_use]
    pub fn malformed_output(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::MalformedOutput, message)
    }

    /// Notification delivery failure.
    #[must_use]
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::Delivery, message)
    }

    /// State store failure.
    #[must_use]
    pub fn state_store(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::StateStore, message)
    }

    /// Per-call timeout.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::Timeout, message)
    }

    /// Deterministic failure.
    #[must_use]
    pub fn logic(message: impl Into<String>) -> Self {
        Self::tagged(FailureTag::Logic, message)
    }

    /// Cancellation.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::tagged(FailureTag::Cancelled, reason)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed_output(err.to_string())
    }
}
