//! Bounded retry with exponential backoff.
//!
//! Every network-bound side effect in a run (status reports, completion
//! notification) and every provider call goes through
//! [`execute_with_retry`]. Failures are classified before deciding whether
//! to back off, so the decision is driven by [`ErrorRecord::can_retry`]
//! rather than by the call site.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::cancellation::CancellationToken;
use crate::errors::{classify, ErrorCode, ErrorRecord, Failure};

/// Jitter applied on top of the exponential delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Retry limits for one kind of call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default side-effect policy (3 attempts, 1s base).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for whole provider calls inside a stage (2 attempts).
    #[must_use]
    pub fn stage_default() -> Self {
        Self::default().with_max_attempts(2)
    }

    /// A policy that never sleeps, for tests and local tooling.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::default()
            .with_max_attempts(max_attempts)
            .with_base_delay_ms(0)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms);

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };
        Duration::from_millis(jittered)
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// Every attempt failed with a retryable error.
    #[error("Failed after {attempts} attempts: {}", last.raw_message)]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Classification of the last failure.
        last: ErrorRecord,
    },

    /// A failure that retrying will not fix.
    #[error("Non-retryable {} on attempt {attempt}: {}", record.code, record.raw_message)]
    NotRetryable {
        /// Attempt that failed.
        attempt: u32,
        /// Classification of the failure.
        record: ErrorRecord,
    },

    /// The run was cancelled before an attempt or during backoff.
    #[error("Cancelled after {attempts} attempts: {}", record.raw_message)]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
        /// Cancellation record.
        record: ErrorRecord,
    },
}

impl RetryError {
    /// The classification that ended the retry loop.
    #[must_use]
    pub const fn record(&self) -> &ErrorRecord {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::NotRetryable { record, .. } | Self::Cancelled { record, .. } => record,
        }
    }

    /// Consumes the error, returning its classification.
    #[must_use]
    pub fn into_record(self) -> ErrorRecord {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::NotRetryable { record, .. } | Self::Cancelled { record, .. } => record,
        }
    }

    /// Attempts made.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
            Self::NotRetryable { attempt, .. } => *attempt,
        }
    }

    /// Returns true if the loop ended because of cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn cancelled_record(cancel: &CancellationToken, stage: u8) -> ErrorRecord {
    ErrorRecord::cancelled(
        stage,
        cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
    )
}

/// Runs `operation` until it succeeds, fails terminally or runs out of attempts.
///
/// The operation receives the 1-based attempt number. Failures are classified
/// against `stage`; non-retryable ones surface immediately without sleeping.
/// Backoff sleeps end early when `cancel` fires.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stage: u8,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
                record: cancelled_record(cancel, stage),
            });
        }

        let failure = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        let record = classify(&failure, stage);

        if record.code == ErrorCode::Cancelled {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                record,
            });
        }
        if !record.can_retry {
            return Err(RetryError::NotRetryable { attempt, record });
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: record,
            });
        }

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            attempt,
            stage,
            code = %record.code,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "Retrying after error"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    record: cancelled_record(cancel, stage),
                });
            }
        }
        attempt += 1;
    }
}

/// Bounds one attempt of a call. An elapsed deadline becomes a timeout failure.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, call: Fut) -> Result<T, Failure>
where
    Fut: Future<Output = Result<T, Failure>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Failure::timeout(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.jitter, JitterStrategy::None);
        assert_eq!(RetryPolicy::stage_default().max_attempts, 2);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new().with_max_delay_ms(5000);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_delay() {
        let policy = RetryPolicy::new().with_jitter(JitterStrategy::Full);
        for _ in 0..50 {
            assert!(policy.delay_for(2) <= Duration::from_secs(2));
        }
        let policy = RetryPolicy::new().with_jitter(JitterStrategy::Equal);
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_backs_off_then_exhausts() {
        let started = Instant::now();
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = execute_with_retry(&RetryPolicy::default(), 4, &cancel, |_| {
            let offsets = offsets.clone();
            async move {
                offsets.lock().push(started.elapsed());
                Err(Failure::new("webhook connection refused"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("after 3 attempts"));
        assert_eq!(err.record().code, ErrorCode::DeliveryFailure);

        let offsets = offsets.lock().clone();
        assert_eq!(offsets.len(), 3);
        let first_gap = offsets[1] - offsets[0];
        let second_gap = offsets[2] - offsets[1];
        assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
        assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_surfaces_without_sleep() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = execute_with_retry(&RetryPolicy::default(), 1, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Failure::new("corrupt PDF")) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::NotRetryable { attempt: 1, .. }));
        assert_eq!(err.record().code, ErrorCode::InputParseError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = execute_with_retry(&RetryPolicy::default(), 2, &cancel, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Failure::rate_limited("slow down"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new().with_base_delay_ms(60_000).with_max_delay_ms(60_000);

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                execute_with_retry(&policy, 3, &cancel, |_| async {
                    Err::<(), _>(Failure::timeout("provider call timed out"))
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel("operator stop");

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.record().code, ErrorCode::Cancelled);
        assert_eq!(err.record().raw_message, "operator stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_tags_elapsed_calls() {
        let err = with_timeout(Duration::from_secs(2), "provider call", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, Failure>(())
        })
        .await
        .unwrap_err();
        assert_eq!(classify(&err, 1).code, ErrorCode::Timeout);
        assert!(err.message.contains("provider call timed out"));

        let ok = with_timeout(Duration::from_secs(2), "quick", async { Ok::<_, Failure>(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel("gone");
        let calls = AtomicU32::new(0);

        let err = execute_with_retry(&RetryPolicy::default(), 1, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Failure>(()) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
