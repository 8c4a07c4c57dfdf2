//! Best-effort repair of near-valid JSON returned by the generation provider.
//!
//! Repair only runs after a strict parse has failed. It applies a short,
//! fixed list of textual rules and returns the result only if it then
//! parses; `None` is an ordinary outcome that sends the stage back to the
//! retry loop.

use regex::Regex;
use std::sync::LazyLock;

/// Repairs provider output that failed strict parsing.
pub trait OutputRepair: Send + Sync {
    /// Returns repaired text that strictly parses, or `None`.
    ///
    /// Implementations must not panic and must be idempotent.
    fn repair(&self, raw: &str) -> Option<String>;
}

struct Rules {
    fence: Regex,
    sibling_objects: Regex,
    sibling_strings: Regex,
    trailing_separator: Regex,
}

impl Rules {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            fence: Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n?(.*?)```")?,
            sibling_objects: Regex::new(r"\}\s*\n\s*\{")?,
            sibling_strings: Regex::new(r#""\s*\n\s*""#)?,
            trailing_separator: Regex::new(r",\s*([}\]])")?,
        })
    }
}

static RULES: LazyLock<Option<Rules>> = LazyLock::new(|| match Rules::compile() {
    Ok(rules) => Some(rules),
    Err(e) => {
        tracing::error!(error = %e, "Output repair rules failed to compile");
        None
    }
});

/// Strictly parses provider output as JSON.
pub fn parse_strict(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(raw.trim())
}

/// Default rule-based JSON repair.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRepair;

impl JsonRepair {
    /// Creates the repairer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl OutputRepair for JsonRepair {
    fn repair(&self, raw: &str) -> Option<String> {
        let rules = RULES.as_ref()?;

        let payload = rules
            .fence
            .captures(raw)
            .and_then(|c| c.get(1))
            .map_or(raw, |m| m.as_str())
            .trim();

        if parse_strict(payload).is_ok() {
            return Some(payload.to_string());
        }

        let text = rules.sibling_objects.replace_all(payload, "},\n{");
        let text = rules.sibling_strings.replace_all(&text, "\",\n\"");
        let text = rules.trailing_separator.replace_all(&text, "$1");

        parse_strict(&text).ok().map(|_| text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn repair(raw: &str) -> Option<serde_json::Value> {
        JsonRepair::new()
            .repair(raw)
            .map(|text| parse_strict(&text).unwrap())
    }

    #[test]
    fn test_extracts_fenced_payload() {
        let raw = "Here is the result:\n```json\n{\"signals\": [1, 2]}\n```\nThanks";
        assert_eq!(repair(raw), Some(json!({"signals": [1, 2]})));
    }

    #[test]
    fn test_extracts_unlabelled_fence_with_array() {
        let raw = "```\n[{\"a\": 1}]\n```";
        assert_eq!(repair(raw), Some(json!([{"a": 1}])));
    }

    #[test]
    fn test_inserts_separator_between_objects() {
        let raw = "{\"opportunities\": [\n  {\"id\": 1}\n  {\"id\": 2}\n]}";
        assert_eq!(repair(raw), Some(json!({"opportunities": [{"id": 1}, {"id": 2}]})));
    }

    #[test]
    fn test_inserts_separator_between_strings() {
        let raw = "{\"tags\": [\n\"bold\"\n\"warm\"\n]}";
        assert_eq!(repair(raw), Some(json!({"tags": ["bold", "warm"]})));
    }

    #[test]
    fn test_inserts_separator_between_properties() {
        let raw = "{\n\"title\": \"Launch\"\n\"summary\": \"Go big\"\n}";
        assert_eq!(repair(raw), Some(json!({"title": "Launch", "summary": "Go big"})));
    }

    #[test]
    fn test_removes_trailing_separators() {
        let raw = "{\"a\": [1, 2, ], \"b\": {\"c\": 3,},}";
        assert_eq!(repair(raw), Some(json!({"a": [1, 2], "b": {"c": 3}})));
    }

    #[test]
    fn test_combined_malformations_inside_fence() {
        let raw = "```json\n{\"items\": [\n{\"x\": \"1\"}\n{\"x\": \"2\"},\n]}\n```";
        assert_eq!(repair(raw), Some(json!({"items": [{"x": "1"}, {"x": "2"}]})));
    }

    #[test]
    fn test_unrepairable_returns_none() {
        let repairer = JsonRepair::new();
        assert_eq!(repairer.repair("not json at all"), None);
        assert_eq!(repairer.repair("{\"a\": "), None);
        assert_eq!(repairer.repair(""), None);
        assert_eq!(repairer.repair("```json\n```"), None);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let repairer = JsonRepair::new();
        for raw in [
            "```json\n{\"a\": [1,]}\n```",
            "{\"o\": [{\"i\": 1}\n{\"i\": 2}]}",
            "{\"k\": \"a,}\"}",
        ] {
            let once = repairer.repair(raw).unwrap();
            assert_eq!(repairer.repair(&once), Some(once.clone()), "{raw}");
        }
    }

    #[test]
    fn test_valid_payload_is_returned_unchanged() {
        let raw = r#"{"text": "keep ,} as is"}"#;
        assert_eq!(JsonRepair::new().repair(raw).as_deref(), Some(raw));
    }

    #[test]
    fn test_never_panics_on_odd_input() {
        let repairer = JsonRepair::new();
        for raw in ["```", "}}}\n{{{", ",]", "\"\n\"", "\u{0}\u{ffff}", "```json"] {
            let _ = repairer.repair(raw);
        }
    }
}
