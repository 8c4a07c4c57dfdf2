//! One summary event per finished run.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::core::Run;
use crate::events::EventSink;

/// Builds the summary payload for a run: identity, outcome, per-status
/// stage counts and a compact row per stage.
#[must_use]
pub fn run_summary(run: &Run) -> Value {
    let mut stage_counts: BTreeMap<String, u32> = BTreeMap::new();
    for stage in &run.stages {
        *stage_counts.entry(stage.status.to_string()).or_insert(0) += 1;
    }

    let stage_details: Vec<Value> = run
        .stages
        .iter()
        .map(|s| {
            json!({
                "stage": s.stage_number,
                "status": s.status,
                "attempts": s.attempts,
                "repaired": s.repaired,
                "from_cache": s.from_cache,
                "error_code": s.error_code,
            })
        })
        .collect();

    json!({
        "run_id": run.run_id,
        "input_id": run.input_id,
        "brand_id": run.brand_id,
        "status": run.overall_status,
        "current_stage": run.current_stage,
        "duration_ms": run.duration_ms(),
        "error_code": run.last_error.as_ref().map(|e| e.code),
        "stage_counts": stage_counts,
        "stage_details": stage_details,
    })
}

/// Emits [`run_summary`] under a fixed event type.
#[derive(Debug, Clone)]
pub struct WideEventEmitter {
    event_type: String,
}

impl Default for WideEventEmitter {
    fn default() -> Self {
        Self {
            event_type: "run.wide".to_string(),
        }
    }
}

impl WideEventEmitter {
    /// Creates an emitter using `run.wide`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the event type.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Emits the summary of `run` to `sink`.
    pub fn emit_run(&self, sink: &dyn EventSink, run: &Run) {
        sink.try_emit(&self.event_type, Some(run_summary(run)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{classify, Failure};
    use crate::events::CollectingEventSink;

    #[test]
    fn test_summary_of_failed_run() {
        let mut run = Run::new("run-1", "doc-1", "brand-1");
        run.advance_to(2).unwrap();
        run.stage_mut(1)
            .unwrap()
            .complete_from_cache(json!({"core_content": "x"}))
            .unwrap();
        run.stage_mut(2)
            .unwrap()
            .fail(crate::errors::ErrorCode::RateLimit, 2)
            .unwrap();
        run.fail(classify(&Failure::new("rate limit exceeded"), 2))
            .unwrap();

        let summary = run_summary(&run);
        assert_eq!(summary["status"], "FAILED");
        assert_eq!(summary["error_code"], "RATE_LIMIT");
        assert_eq!(summary["stage_counts"]["PENDING"], 3);
        assert_eq!(summary["stage_counts"]["COMPLETE"], 1);
        assert_eq!(summary["stage_details"][0]["from_cache"], true);
        assert_eq!(summary["stage_details"][1]["attempts"], 2);
    }

    #[test]
    fn test_emitter_uses_event_type() {
        let sink = CollectingEventSink::new();
        let run = Run::new("run-2", "doc", "brand");
        WideEventEmitter::new()
            .with_event_type("batch.run")
            .emit_run(&sink, &run);

        assert_eq!(sink.types(), vec!["batch.run"]);
        assert_eq!(sink.events()[0].field("run_id"), Some(&json!("run-2")));
    }
}
