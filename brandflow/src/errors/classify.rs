//! Failure classification into the fixed error taxonomy.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Failure, FailureTag};

/// Canonical error kinds, in keyword matching precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad source data.
    InputParseError,
    /// Upstream rate limiting or quota exhaustion.
    RateLimit,
    /// Transient generation provider failure.
    ProviderError,
    /// Notification channel failure.
    DeliveryFailure,
    /// Status store failure.
    StateStoreError,
    /// A call exceeded its deadline.
    Timeout,
    /// Deterministic bug.
    LogicError,
    /// Anything unrecognised.
    Unknown,
    /// The run was cancelled. Only produced from a cancellation tag.
    Cancelled,
}

impl ErrorCode {
    /// Whether resubmitting the same request is likely to succeed.
    #[must_use]
    pub const fn can_retry(self) -> bool {
        match self {
            Self::RateLimit
            | Self::ProviderError
            | Self::DeliveryFailure
            | Self::StateStoreError
            | Self::Timeout
            | Self::Cancelled => true,
            Self::InputParseError | Self::LogicError | Self::Unknown => false,
        }
    }

    /// Canned user-facing sentence for this kind.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::InputParseError => {
                "The source document could not be read. Please check the file and submit it again."
            }
            Self::RateLimit => {
                "The generation service is busy right now. Please try again in a few minutes."
            }
            Self::ProviderError => {
                "The generation service returned an unexpected response. Please try again."
            }
            Self::DeliveryFailure => {
                "The results could not be delivered. Please try again."
            }
            Self::StateStoreError => "Pipeline progress could not be saved. Please try again.",
            Self::Timeout => "The operation took too long to complete. Please try again.",
            Self::LogicError => {
                "An internal processing error occurred. Please contact support."
            }
            Self::Unknown => {
                "An unexpected error occurred. Please contact support if this keeps happening."
            }
            Self::Cancelled => "The pipeline run was cancelled before it finished.",
        }
    }

    const fn from_tag(tag: FailureTag) -> Self {
        match tag {
            FailureTag::InputParse => Self::InputParseError,
            FailureTag::RateLimited => Self::RateLimit,
            FailureTag::Provider | FailureTag::MalformedOutput => Self::ProviderError,
            FailureTag::Delivery => Self::DeliveryFailure,
            FailureTag::StateStore => Self::StateStoreError,
            FailureTag::Timeout => Self::Timeout,
            FailureTag::Logic => Self::LogicError,
            FailureTag::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputParseError => "INPUT_PARSE_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::DeliveryFailure => "DELIVERY_FAILURE",
            Self::StateStoreError => "STATE_STORE_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::LogicError => "LOGIC_ERROR",
            Self::Unknown => "UNKNOWN",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

// Checked top to bottom; first hit wins.
const KEYWORDS: &[(ErrorCode, &[&str])] = &[
    (
        ErrorCode::InputParseError,
        &[
            "pdf",
            "extract text",
            "text extraction",
            "corrupt",
            "unreadable",
            "parse document",
            "input parse",
        ],
    ),
    (
        ErrorCode::RateLimit,
        &["rate limit", "rate_limit", "ratelimit", "429", "quota", "too many requests"],
    ),
    (
        ErrorCode::ProviderError,
        &[
            "llm",
            "openai",
            "anthropic",
            "openrouter",
            "api key",
            "api_key",
            "generation provider",
            "completion api",
        ],
    ),
    (
        ErrorCode::DeliveryFailure,
        &[
            "webhook",
            "notification",
            "notifier",
            "delivery",
            "connection refused",
            "connection reset",
            "connectionerror",
        ],
    ),
    (
        ErrorCode::StateStoreError,
        &["database", "prisma", "state store", "status update"],
    ),
    (
        ErrorCode::Timeout,
        &["timed out", "timeout", "deadline exceeded"],
    ),
    (
        ErrorCode::LogicError,
        &[
            "logic error",
            "invariant",
            "assertion failed",
            "panicked",
            "unreachable",
        ],
    ),
];

fn code_for(failure: &Failure) -> ErrorCode {
    if let Some(tag) = failure.tag {
        return ErrorCode::from_tag(tag);
    }
    let text = failure.message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map_or(ErrorCode::Unknown, |(code, _)| *code)
}

/// Classification of one failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Error kind.
    pub code: ErrorCode,
    /// Stage the failure belongs to.
    pub stage: u8,
    /// Raw failure text. Internal only.
    pub raw_message: String,
    /// Retry eligibility.
    pub can_retry: bool,
    /// Canned message safe to show to users.
    pub user_message: String,
    /// When the failure was classified.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Record for a cancelled run.
    #[must_use]
    pub fn cancelled(stage: u8, reason: impl Into<String>) -> Self {
        classify(&Failure::cancelled(reason), stage)
    }

    /// Prefixes the raw message with a note, keeping the classification.
    #[must_use]
    pub fn with_note(mut self, note: &str) -> Self {
        self.raw_message = format!("{note}: {}", self.raw_message);
        self
    }

    /// Builds the stable external payload for a failed run.
    #[must_use]
    pub fn to_payload(&self, run_id: &str) -> ErrorPayload {
        ErrorPayload {
            run_id: run_id.to_string(),
            status: "FAILED".to_string(),
            error: ErrorDetail {
                stage: self.stage,
                code: self.code,
                message: self.user_message.clone(),
                timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                can_retry: self.can_retry,
            },
        }
    }
}

/// Classifies a failure using the current time.
#[must_use]
pub fn classify(failure: &Failure, stage: u8) -> ErrorRecord {
    classify_at(failure, stage, Utc::now())
}

/// Classifies a failure with an explicit timestamp.
#[must_use]
pub fn classify_at(failure: &Failure, stage: u8, timestamp: DateTime<Utc>) -> ErrorRecord {
    let code = code_for(failure);
    ErrorRecord {
        code,
        stage,
        raw_message: failure.message.clone(),
        can_retry: code.can_retry(),
        user_message: code.user_message().to_string(),
        timestamp,
    }
}

/// Error payload reported for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// The failed run.
    pub run_id: String,
    /// Always `FAILED`.
    pub status: String,
    /// Error details.
    pub error: ErrorDetail,
}

/// The `error` object of an [`ErrorPayload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    /// Failed stage number.
    pub stage: u8,
    /// Error kind.
    pub code: ErrorCode,
    /// Canned user message.
    pub message: String,
    /// ISO-8601 UTC timestamp.
    pub timestamp: String,
    /// Whether resubmission is likely to help.
    pub can_retry: bool,
}
