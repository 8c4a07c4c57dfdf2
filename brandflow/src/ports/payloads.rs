//! Data exchanged with collaborators.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::core::{Run, StageExecution, StageStatus};
use crate::errors::ErrorCode;

/// Brand profile as a key-value map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrandProfile(pub BTreeMap<String, Value>);

impl BrandProfile {
    /// Builds a profile from a JSON object. Other values give an empty profile.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map.into_iter().collect()),
            _ => Self::default(),
        }
    }

    /// Returns a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Brand name from the profile, or `fallback`.
    #[must_use]
    pub fn display_name(&self, fallback: &str) -> String {
        ["company_name", "brand_name", "name"]
            .iter()
            .find_map(|k| self.get(k).and_then(Value::as_str))
            .unwrap_or(fallback)
            .to_string()
    }
}

/// One stage transition as reported to the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageStatusUpdate {
    /// Run identifier.
    pub run_id: String,
    /// Stage number.
    pub stage_number: u8,
    /// Stage name.
    pub stage_name: String,
    /// New status.
    pub status: StageStatus,
    /// Output, once complete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error code, once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Terminal time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageStatusUpdate {
    /// Snapshot of a stage record.
    #[must_use]
    pub fn from_stage(run_id: &str, stage_name: &str, stage: &StageExecution) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage_number: stage.stage_number,
            stage_name: stage_name.to_string(),
            status: stage.status,
            output: stage.output.clone(),
            error_code: stage.error_code,
            completed_at: stage.completed_at,
        }
    }
}

/// Body sent to the completion notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    /// Run identifier.
    pub run_id: String,
    /// Always `COMPLETED`.
    pub status: String,
    /// ISO-8601 UTC completion time.
    pub completed_at: String,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// Outputs keyed `stage1` to `stage5`.
    pub stage_outputs: BTreeMap<String, Value>,
    /// Rendered human-readable summary.
    pub summary: String,
}

impl CompletionPayload {
    /// Builds the payload for a completed run.
    #[must_use]
    pub fn from_run(run: &Run, summary: String) -> Self {
        let completed_at = run.completed_at.unwrap_or_else(Utc::now);
        Self {
            run_id: run.run_id.clone(),
            status: "COMPLETED".to_string(),
            completed_at: completed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms: run.duration_ms(),
            stage_outputs: run
                .stage_outputs()
                .into_iter()
                .map(|(n, v)| (format!("stage{n}"), v))
                .collect(),
            summary,
        }
    }
}

/// Renders the human-readable summary sent with a completed run.
pub trait ReportRenderer: Send + Sync {
    /// Renders a summary for a completed run.
    fn render(&self, run: &Run) -> String;
}

/// Minimal markdown summary listing the generated opportunities.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSummaryRenderer;

impl ReportRenderer for PlainSummaryRenderer {
    fn render(&self, run: &Run) -> String {
        let mut out = format!(
            "# Brand opportunities\n\nInput: {}\nBrand: {}\n",
            run.input_id, run.brand_id
        );
        let opportunities = run
            .stage(5)
            .and_then(|s| s.output.as_ref())
            .and_then(|o| o.get("opportunities"))
            .and_then(Value::as_array);

        if let Some(items) = opportunities {
            out.push('\n');
            for (i, item) in items.iter().enumerate() {
                let title = item
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Untitled opportunity");
                let _ = writeln!(out, "{}. {title}", i + 1);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_display_name() {
        let profile = BrandProfile::from_value(json!({"brand_name": "Nova", "name": "ignored"}));
        assert_eq!(profile.display_name("fallback"), "Nova");
        assert_eq!(BrandProfile::default().display_name("brand-7"), "brand-7");
        assert_eq!(BrandProfile::from_value(json!([1])), BrandProfile::default());
    }

    #[test]
    fn test_completion_payload_keys() {
        let mut run = Run::new("run-1", "doc-1", "brand-1");
        for n in 1..=5 {
            run.stage_mut(n)
                .unwrap()
                .complete_from_cache(json!({"n": n}))
                .unwrap();
        }
        run.complete().unwrap();

        let payload = CompletionPayload::from_run(&run, "summary".to_string());
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["status"], "COMPLETED");
        assert_eq!(value["stageOutputs"]["stage5"], json!({"n": 5}));
        assert!(value["completedAt"].as_str().unwrap().ends_with('Z'));
        assert!(value["durationMs"].as_i64().unwrap() >= 0);
    }

    #[test]
    fn test_stage_update_skips_empty_fields() {
        let stage = StageExecution::new(2);
        let update = StageStatusUpdate::from_stage("run-1", "Signal Amplification", &stage);
        let value = serde_json::to_value(update).unwrap();
        assert_eq!(value["stageNumber"], 2);
        assert_eq!(value["status"], "PENDING");
        assert!(value.get("output").is_none());
    }

    #[test]
    fn test_plain_summary_lists_titles() {
        let mut run = Run::new("run-1", "doc-1", "brand-1");
        run.stage_mut(5)
            .unwrap()
            .complete_from_cache(json!({"opportunities": [{"title": "Pop-up"}, {}]}))
            .unwrap();
        let text = PlainSummaryRenderer.render(&run);
        assert!(text.contains("1. Pop-up"));
        assert!(text.contains("2. Untitled opportunity"));
    }
}
