//! Parser for the agent CLIs' newline-delimited JSON output.
//!
//! Lines are parsed independently. Anything that is not recognizable JSON
//! degrades to [`StreamEvent::Info`] instead of failing the run.

use serde_json::Value;

/// One event decoded from a line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Model reasoning text.
    Thinking(String),
    /// Assistant message text. Cumulative for CLIs that stream snapshots.
    AssistantText(String),
    ToolUse { name: String, input: Value },
    ToolResult(String),
    /// Terminal event carrying the definitive output.
    Result(String),
    Error(String),
    /// Unstructured text passed through as is.
    Info(String),
}

/// Decode one output line into zero or more events.
pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => {
            // Single stray characters (progress spinners, dots) are noise.
            if trimmed.chars().count() > 1 {
                return vec![StreamEvent::Info(trimmed.to_string())];
            }
            return Vec::new();
        }
    };

    let Some(object) = value.as_object() else {
        return vec![StreamEvent::Info(trimmed.to_string())];
    };

    match object.get("type").and_then(Value::as_str) {
        Some("thinking") => text_field(&value, "text")
            .filter(|t| !t.is_empty())
            .map(|t| vec![StreamEvent::Thinking(t)])
            .unwrap_or_default(),
        Some("assistant") => parse_assistant(&value),
        Some("tool_use") => vec![StreamEvent::ToolUse {
            name: text_field(&value, "name").unwrap_or_default(),
            input: value.get("input").cloned().unwrap_or(Value::Null),
        }],
        Some("tool_call") => parse_tool_call(&value),
        Some("tool_result") => vec![StreamEvent::ToolResult(content_text(value.get("content")))],
        Some("result") => {
            let text = text_field(&value, "result").unwrap_or_default();
            if value.get("is_error").and_then(Value::as_bool) == Some(true) {
                vec![StreamEvent::Error(text)]
            } else {
                vec![StreamEvent::Result(text)]
            }
        }
        Some("error") => vec![StreamEvent::Error(error_text(&value))],
        // Session bookkeeping and prompt echoes.
        Some("system") | Some("user") => Vec::new(),
        Some(_) => Vec::new(),
        None if object.contains_key("error") => vec![StreamEvent::Error(error_text(&value))],
        None => vec![StreamEvent::Info(trimmed.to_string())],
    }
}

fn parse_assistant(value: &Value) -> Vec<StreamEvent> {
    let Some(items) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    let mut text = String::new();
    let mut text_slot = None;

    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = item.get("text").and_then(Value::as_str) {
                    if text_slot.is_none() {
                        text_slot = Some(events.len());
                    }
                    text.push_str(t);
                }
            }
            Some("tool_use") => events.push(StreamEvent::ToolUse {
                name: text_field(item, "name").unwrap_or_default(),
                input: item.get("input").cloned().unwrap_or(Value::Null),
            }),
            Some("tool_result") => {
                events.push(StreamEvent::ToolResult(content_text(item.get("content"))))
            }
            _ => {}
        }
    }

    // All text items form one message, since cumulative diffing works on the whole text.
    if let Some(slot) = text_slot {
        if !text.is_empty() {
            events.insert(slot, StreamEvent::AssistantText(text));
        }
    }
    events
}

/// Cursor reports tools as `{"type":"tool_call","subtype":"started","tool_call":{"readToolCall":{...}}}`.
fn parse_tool_call(value: &Value) -> Vec<StreamEvent> {
    if value.get("subtype").and_then(Value::as_str) != Some("started") {
        return Vec::new();
    }
    let Some(call) = value.get("tool_call").and_then(Value::as_object) else {
        return Vec::new();
    };
    call.iter()
        .next()
        .map(|(name, input)| {
            vec![StreamEvent::ToolUse {
                name: name.trim_end_matches("ToolCall").to_string(),
                input: input.get("args").cloned().unwrap_or_else(|| input.clone()),
            }]
        })
        .unwrap_or_default()
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn error_text(value: &Value) -> String {
    match value.get("error").or_else(|| value.get("message")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(o)) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(o.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unknown error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_thinking() {
        let events = parse_line(r#"{"type":"thinking","text":"Considering options"}"#);
        assert_eq!(events, vec![StreamEvent::Thinking("Considering options".to_string())]);
    }

    #[test]
    fn test_parse_assistant_content_items() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Reading "},
                {"type": "tool_use", "name": "read_file", "input": {"path": "a.rs"}},
                {"type": "text", "text": "the file"},
                {"type": "tool_result", "content": "fn main() {}"}
            ]}
        })
        .to_string();

        let events = parse_line(&line);
        assert_eq!(
            events,
            vec![
                StreamEvent::AssistantText("Reading the file".to_string()),
                StreamEvent::ToolUse {
                    name: "read_file".to_string(),
                    input: json!({"path": "a.rs"})
                },
                StreamEvent::ToolResult("fn main() {}".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_top_level_tool_events() {
        let events = parse_line(r#"{"type":"tool_use","name":"shell","input":{"cmd":"ls"}}"#);
        assert!(matches!(&events[0], StreamEvent::ToolUse { name, .. } if name == "shell"));

        let events = parse_line(r#"{"type":"tool_result","content":[{"type":"text","text":"ok"}]}"#);
        assert_eq!(events, vec![StreamEvent::ToolResult("ok".to_string())]);
    }

    #[test]
    fn test_parse_cursor_tool_call() {
        let started = r#"{"type":"tool_call","subtype":"started","tool_call":{"readToolCall":{"args":{"path":"x"}}}}"#;
        assert_eq!(
            parse_line(started),
            vec![StreamEvent::ToolUse {
                name: "read".to_string(),
                input: json!({"path": "x"})
            }]
        );

        let completed = r#"{"type":"tool_call","subtype":"completed","tool_call":{}}"#;
        assert!(parse_line(completed).is_empty());
    }

    #[test]
    fn test_parse_result_and_errors() {
        assert_eq!(
            parse_line(r#"{"type":"result","result":"All done"}"#),
            vec![StreamEvent::Result("All done".to_string())]
        );
        assert_eq!(
            parse_line(r#"{"type":"result","is_error":true,"result":"quota exceeded"}"#),
            vec![StreamEvent::Error("quota exceeded".to_string())]
        );
        assert_eq!(
            parse_line(r#"{"error":{"message":"rate limit"}}"#),
            vec![StreamEvent::Error("rate limit".to_string())]
        );
        assert_eq!(
            parse_line(r#"{"type":"error","message":"boom"}"#),
            vec![StreamEvent::Error("boom".to_string())]
        );
    }

    #[test]
    fn test_unparseable_lines_degrade_to_info() {
        assert_eq!(
            parse_line("Loading workspace..."),
            vec![StreamEvent::Info("Loading workspace...".to_string())]
        );
        assert!(parse_line("   ").is_empty());
        assert!(parse_line(".").is_empty());
        assert_eq!(parse_line("42"), vec![StreamEvent::Info("42".to_string())]);
    }

    #[test]
    fn test_suppressed_event_types() {
        assert!(parse_line(r#"{"type":"system","subtype":"init"}"#).is_empty());
        assert!(parse_line(r#"{"type":"user","message":{}}"#).is_empty());
    }
}
