//! Per-input cache of the input-only stage prefix.
//!
//! Within one batch session the prefix for an input is computed at most once
//! successfully. Concurrent runs for the same input queue behind the
//! in-flight computation and then read its result. A failed computation is
//! stored too, so every queued brand run sees the same failure instead of
//! retrying the expensive prefix on its own.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use super::runner::StageOutput;
use crate::cancellation::CancellationToken;
use crate::errors::{ErrorCode, ErrorRecord};

/// Memoized outputs of the input-only stages for one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Input the prefix was computed for.
    pub input_id: String,
    /// Outputs in stage order.
    pub prefix_outputs: Vec<StageOutput>,
    /// When the computation finished.
    pub computed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(input_id: impl Into<String>, prefix_outputs: Vec<StageOutput>) -> Self {
        Self {
            input_id: input_id.into(),
            prefix_outputs,
            computed_at: Utc::now(),
        }
    }

    /// SHA-256 over the serialized output values, hex encoded.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for output in &self.prefix_outputs {
            hasher.update([output.stage]);
            hasher.update(output.value.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// A prefix failure shared by every run for the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Shared prefix for input {input_id} failed: {}", record.raw_message)]
pub struct SharedPrefixFailure {
    /// Input whose prefix failed.
    pub input_id: String,
    /// Classification of the failure.
    pub record: ErrorRecord,
}

/// Why a prefix lookup did not produce an entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrefixError {
    /// The prefix computation failed for this session.
    #[error("{failure}")]
    Shared {
        /// The stored failure.
        failure: SharedPrefixFailure,
        /// Whether this caller ran the failed computation.
        computed_here: bool,
    },

    /// The caller was cancelled while computing or waiting.
    #[error("Prefix lookup cancelled: {}", .0.raw_message)]
    Cancelled(ErrorRecord),
}

/// Successful prefix lookup.
#[derive(Debug, Clone)]
pub struct PrefixLookup {
    /// The shared entry.
    pub entry: Arc<CacheEntry>,
    /// Whether this caller computed it.
    pub computed_here: bool,
}

type Slot = Arc<OnceCell<Result<Arc<CacheEntry>, SharedPrefixFailure>>>;

/// Session-scoped prefix cache. Entries are never invalidated.
#[derive(Debug, Default)]
pub struct PrefixCache {
    slots: DashMap<String, Slot>,
    computations: AtomicUsize,
}

impl PrefixCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inputs with a settled prefix (success or failure).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value().initialized()).count()
    }

    /// Returns true if nothing has settled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times a compute function was started.
    #[must_use]
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    /// Returns the prefix for `input_id`, running `compute` only if no other
    /// caller has settled it.
    ///
    /// A compute result whose code is `CANCELLED` is not stored, so the next
    /// queued caller computes instead. Any other failure is stored and shared.
    pub async fn get_or_compute_prefix<F, Fut>(
        &self,
        input_id: &str,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<PrefixLookup, PrefixError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<StageOutput>, ErrorRecord>>,
    {
        // Clone the slot out so the map shard is not locked across awaits.
        let slot: Slot = self.slots.entry(input_id.to_string()).or_default().clone();

        let computed = AtomicBool::new(false);
        let flag = &computed;
        let mut init = std::pin::pin!(slot.get_or_try_init(|| async move {
            flag.store(true, Ordering::SeqCst);
            self.computations.fetch_add(1, Ordering::SeqCst);
            match compute().await {
                Ok(outputs) => Ok(Ok(Arc::new(CacheEntry::new(input_id, outputs)))),
                Err(record) if record.code == ErrorCode::Cancelled => Err(record),
                Err(record) => Ok(Err(SharedPrefixFailure {
                    input_id: input_id.to_string(),
                    record,
                })),
            }
        }));

        let settled = tokio::select! {
            biased;
            result = &mut init => result,
            () = cancel.cancelled() => {
                // A computing caller lets its compute observe the token and
                // record the stage failure before settling.
                if computed.load(Ordering::SeqCst) {
                    init.as_mut().await
                } else {
                    return Err(PrefixError::Cancelled(ErrorRecord::cancelled(
                        1,
                        cancel.reason().unwrap_or_else(|| "run cancelled".to_string()),
                    )));
                }
            }
        };

        let computed_here = computed.load(Ordering::SeqCst);
        match settled {
            Ok(Ok(entry)) => Ok(PrefixLookup {
                entry: Arc::clone(entry),
                computed_here,
            }),
            Ok(Err(failure)) => Err(PrefixError::Shared {
                failure: failure.clone(),
                computed_here,
            }),
            Err(record) => Err(PrefixError::Cancelled(record)),
        }
    }
}
