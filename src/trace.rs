// ABOUTME: Parses the trajectory file the trae CLI writes describing what it did.
// ABOUTME: Parsing never fails upward - a bad file degrades to None and raw output wins.

use crate::response::ToolInvocation;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// The parsed contents of a trajectory file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceRecord {
    /// Explicit success flag, when the agent wrote one
    pub success: Option<bool>,
    /// Final textual result, when present
    pub final_result: Option<String>,
    /// Tool calls with results correlated via call id
    pub tool_calls: Vec<ToolInvocation>,
}

impl TraceRecord {
    /// Read and parse a trajectory file. Missing or unparseable files yield
    /// `None`; the caller falls back to raw captured output.
    pub fn from_file(path: &Path) -> Option<TraceRecord> {
        let text = std::fs::read_to_string(path).ok()?;
        let record = Self::parse(&text);
        if record.is_none() {
            tracing::warn!(path = %path.display(), "Trajectory file present but unparseable");
        }
        record
    }

    /// Parse trajectory JSON. Tool-call and tool-result arrays may appear at
    /// the top level and/or nested under step objects.
    pub fn parse(text: &str) -> Option<TraceRecord> {
        let root: Value = serde_json::from_str(text).ok()?;
        let obj = root.as_object()?;

        let mut calls: Vec<(String, String, Value)> = Vec::new();
        let mut results: HashMap<String, String> = HashMap::new();

        collect_level(&root, &mut calls, &mut results);
        for key in ["steps", "agent_steps"] {
            if let Some(steps) = obj.get(key).and_then(Value::as_array) {
                for step in steps {
                    collect_level(step, &mut calls, &mut results);
                }
            }
        }

        let tool_calls = calls
            .into_iter()
            .map(|(call_id, name, arguments)| {
                let result = results.get(&call_id).cloned();
                ToolInvocation {
                    call_id,
                    name,
                    arguments,
                    result,
                }
            })
            .collect();

        Some(TraceRecord {
            success: obj.get("success").and_then(Value::as_bool),
            final_result: obj
                .get("final_result")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls,
        })
    }
}

fn collect_level(
    level: &Value,
    calls: &mut Vec<(String, String, Value)>,
    results: &mut HashMap<String, String>,
) {
    let Some(obj) = level.as_object() else {
        return;
    };

    if let Some(items) = obj.get("tool_calls").and_then(Value::as_array) {
        for item in items {
            let Some(call_id) = item.get("call_id").and_then(Value::as_str) else {
                continue;
            };
            let name = item
                .get("name")
                .or_else(|| item.get("tool_name"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let arguments = item
                .get("arguments")
                .or_else(|| item.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            calls.push((call_id.to_string(), name.to_string(), arguments));
        }
    }

    if let Some(items) = obj.get("tool_results").and_then(Value::as_array) {
        for item in items {
            let Some(call_id) = item.get("call_id").and_then(Value::as_str) else {
                continue;
            };
            let result = item.get("result").or_else(|| item.get("output"));
            let text = match result {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => continue,
            };
            results.insert(call_id.to_string(), text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_calls_and_results() {
        let record = TraceRecord::parse(
            r#"{"success": true, "final_result": "done",
                "tool_calls":[{"call_id":"1","name":"x"}],
                "tool_results":[{"call_id":"1","result":"ok"}]}"#,
        )
        .unwrap();
        assert_eq!(record.success, Some(true));
        assert_eq!(record.final_result.as_deref(), Some("done"));
        assert_eq!(record.tool_calls.len(), 1);
        assert_eq!(record.tool_calls[0].name, "x");
        assert_eq!(record.tool_calls[0].result.as_deref(), Some("ok"));
    }

    #[test]
    fn parses_calls_nested_under_steps() {
        let record = TraceRecord::parse(
            r#"{"agent_steps": [
                {"tool_calls":[{"call_id":"a","name":"read","arguments":{"path":"f"}}],
                 "tool_results":[{"call_id":"a","result":{"ok":true}}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(record.tool_calls.len(), 1);
        assert_eq!(record.tool_calls[0].call_id, "a");
        assert_eq!(record.tool_calls[0].result.as_deref(), Some("{\"ok\":true}"));
    }

    #[test]
    fn unparseable_text_degrades_to_none() {
        assert!(TraceRecord::parse("not json at all").is_none());
        assert!(TraceRecord::parse("[1,2,3]").is_none());
    }

    #[test]
    fn missing_file_degrades_to_none() {
        assert!(TraceRecord::from_file(Path::new("/nonexistent/trace.json")).is_none());
    }
}
