//! Host interface: how the plan runtime reaches the agent's tools.
//!
//! The runtime owns no tools of its own. The embedding agent hands it a
//! [`ToolHost`]; every asynchronous binding in plan scope funnels through
//! `call_tool`. Arguments and results cross the boundary as JSON so the
//! host never sees interpreter values.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub trait ToolHost: Send + Sync {
    /// Whether `name` is a tool this host can dispatch.
    fn has_tool(&self, name: &str) -> bool;

    /// Tool names beyond the built-in set (e.g. MCP imports). These extend
    /// the asynchronous-name set used by await-point analysis and become
    /// callable bindings in plan scope.
    fn extra_tool_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoke a tool. An `Err` message is thrown into plan code (and is
    /// catchable there); it must already be model-presentable.
    fn call_tool(
        &self,
        name: &str,
        args: Vec<serde_json::Value>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, String>>;
}

/// Normalize a raw tool result for plan code:
/// 1. unwrap the `{content: [{type: "text", text: …}]}` envelope;
/// 2. auto-parse text that looks like a JSON object or array;
/// 3. leave everything else as-is.
pub fn normalize_tool_result(raw: serde_json::Value) -> serde_json::Value {
    let unwrapped = unwrap_content_envelope(raw);
    match unwrapped {
        serde_json::Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(parsed @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
                        parsed
                    }
                    _ => serde_json::Value::String(text),
                }
            } else {
                serde_json::Value::String(text)
            }
        }
        other => other,
    }
}

fn unwrap_content_envelope(raw: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(map) = &raw else {
        return raw;
    };
    if map.len() != 1 {
        return raw;
    }
    let Some(serde_json::Value::Array(parts)) = map.get("content") else {
        return raw;
    };
    let mut texts = Vec::with_capacity(parts.len());
    for part in parts {
        let serde_json::Value::Object(part) = part else {
            return raw;
        };
        if part.get("type").and_then(|t| t.as_str()) != Some("text") {
            return raw;
        }
        match part.get("text").and_then(|t| t.as_str()) {
            Some(text) => texts.push(text.to_string()),
            None => return raw,
        }
    }
    serde_json::Value::String(texts.join("\n"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn unwraps_text_envelope_then_parses_json() {
        let raw = json!({"content": [{"type": "text", "text": "{\"hits\": 3}"}]});
        assert_eq!(normalize_tool_result(raw), json!({"hits": 3}));
    }

    #[test]
    fn envelope_with_plain_text_stays_text() {
        let raw = json!({"content": [{"type": "text", "text": "no results"}]});
        assert_eq!(normalize_tool_result(raw), json!("no results"));
    }

    #[test]
    fn json_looking_strings_are_parsed() {
        assert_eq!(normalize_tool_result(json!("[1, 2]")), json!([1, 2]));
        assert_eq!(
            normalize_tool_result(json!("{\"a\": 1}")),
            json!({"a": 1})
        );
    }

    #[test]
    fn malformed_json_strings_stay_strings() {
        assert_eq!(
            normalize_tool_result(json!("{not json")),
            json!("{not json")
        );
    }

    #[test]
    fn structured_results_pass_through() {
        assert_eq!(
            normalize_tool_result(json!({"files": ["a.rs"]})),
            json!({"files": ["a.rs"]})
        );
        assert_eq!(normalize_tool_result(json!(42)), json!(42));
    }

    #[test]
    fn non_text_envelope_is_left_alone() {
        let raw = json!({"content": [{"type": "image", "data": "…"}]});
        assert_eq!(normalize_tool_result(raw.clone()), raw);
    }
}
