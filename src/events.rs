//! Worker event stream decoding.
//!
//! The worker CLI writes one self-describing JSON record per line. This
//! module turns raw output bytes into typed [`WorkerEvent`]s:
//!
//! - [`LineAssembler`] splits the byte stream on newline boundaries and
//!   carries a trailing partial line across reads, so a record split over
//!   two chunks still decodes as one event.
//! - [`decode_line`] maps one complete line to an event. Unknown record
//!   types that carry text are treated as text; a line that is not a
//!   record at all becomes plain text rather than an error.

use crate::types::TokenUsage;
use serde_json::Value;

/// One typed event from the worker's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker announced its native session id (needed for resume).
    Session { id: String },
    /// The worker invoked a tool. Counts one iteration in agent sessions.
    ToolUse { name: String, input: Value },
    /// Result of a previous tool invocation.
    ToolResult { output: String },
    /// A chunk of assistant text.
    Text(String),
    /// Token accounting reported mid-stream or at completion.
    Usage(TokenUsage),
    /// The worker reported an error condition.
    Error(String),
    /// Terminal record; may carry final text and usage.
    Done {
        text: Option<String>,
        usage: Option<TokenUsage>,
    },
}

/// Decode one complete output line.
///
/// Returns `None` only for blank lines and for records that carry nothing
/// usable (e.g. an unknown type with no textual payload).
pub fn decode_line(line: &str) -> Option<WorkerEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        // Not a record; surface it as plain text.
        return Some(WorkerEvent::Text(line.to_string()));
    };
    let Some(obj) = value.as_object() else {
        return Some(WorkerEvent::Text(line.to_string()));
    };

    let kind = obj.get("type").and_then(Value::as_str).unwrap_or("");
    match kind {
        "session" => obj
            .get("session_id")
            .or_else(|| obj.get("id"))
            .and_then(Value::as_str)
            .map(|id| WorkerEvent::Session { id: id.to_string() }),

        "tool_use" | "tool_code" => {
            let name = obj
                .get("tool_name")
                .or_else(|| obj.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = obj
                .get("tool_input")
                .or_else(|| obj.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(WorkerEvent::ToolUse { name, input })
        }

        "tool_result" => {
            let output = obj
                .get("content")
                .or_else(|| obj.get("text"))
                .or_else(|| obj.get("output"))
                .map(value_to_text)
                .unwrap_or_default();
            Some(WorkerEvent::ToolResult { output })
        }

        "text" | "message" => text_payload(obj).map(WorkerEvent::Text),

        "usage" | "stats" => Some(WorkerEvent::Usage(usage_payload(obj))),

        "error" => {
            let message = obj
                .get("error")
                .or_else(|| obj.get("message"))
                .map(value_to_text)
                .unwrap_or_else(|| "unspecified worker error".to_string());
            Some(WorkerEvent::Error(message))
        }

        "result" | "done" => Some(WorkerEvent::Done {
            text: text_payload(obj),
            usage: has_usage_fields(obj).then(|| usage_payload(obj)),
        }),

        // Unknown kinds with a textual payload degrade to text.
        _ => text_payload(obj).map(WorkerEvent::Text),
    }
}

fn text_payload(obj: &serde_json::Map<String, Value>) -> Option<String> {
    obj.get("content")
        .or_else(|| obj.get("text"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn has_usage_fields(obj: &serde_json::Map<String, Value>) -> bool {
    obj.contains_key("input_tokens")
        || obj.contains_key("output_tokens")
        || obj.contains_key("metrics")
        || obj.contains_key("usage")
}

fn usage_payload(obj: &serde_json::Map<String, Value>) -> TokenUsage {
    // Counts live either at the top level or nested under metrics/usage.
    let nested = obj
        .get("metrics")
        .or_else(|| obj.get("usage"))
        .and_then(Value::as_object);
    let read = |key: &str| {
        obj.get(key)
            .or_else(|| nested.and_then(|n| n.get(key)))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    TokenUsage::new(read("input_tokens"), read("output_tokens"))
}

/// Splits a byte stream into complete lines, carrying a trailing partial
/// line across feeds.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes; returns every line completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                lines.push(line);
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Drain any trailing partial line at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_session_record() {
        let event = decode_line(r#"{"type":"session","session_id":"gem-123"}"#).unwrap();
        assert_eq!(
            event,
            WorkerEvent::Session {
                id: "gem-123".to_string()
            }
        );
    }

    #[test]
    fn test_decode_tool_use_with_aliases() {
        let event =
            decode_line(r#"{"type":"tool_use","tool_name":"write_file","tool_input":{"path":"a"}}"#)
                .unwrap();
        assert_eq!(
            event,
            WorkerEvent::ToolUse {
                name: "write_file".to_string(),
                input: json!({"path": "a"}),
            }
        );

        let event = decode_line(r#"{"type":"tool_code","name":"shell","input":{"cmd":"ls"}}"#)
            .unwrap();
        assert!(matches!(event, WorkerEvent::ToolUse { name, .. } if name == "shell"));
    }

    #[test]
    fn test_decode_text_and_message() {
        assert_eq!(
            decode_line(r#"{"type":"text","content":"hello"}"#).unwrap(),
            WorkerEvent::Text("hello".to_string())
        );
        assert_eq!(
            decode_line(r#"{"type":"message","text":"hi"}"#).unwrap(),
            WorkerEvent::Text("hi".to_string())
        );
    }

    #[test]
    fn test_decode_usage_nested_metrics() {
        let event =
            decode_line(r#"{"type":"stats","metrics":{"input_tokens":10,"output_tokens":20}}"#)
                .unwrap();
        assert_eq!(event, WorkerEvent::Usage(TokenUsage::new(10, 20)));

        let event = decode_line(r#"{"type":"usage","input_tokens":5,"output_tokens":7}"#).unwrap();
        assert_eq!(event, WorkerEvent::Usage(TokenUsage::new(5, 7)));
    }

    #[test]
    fn test_decode_error_record() {
        let event = decode_line(r#"{"type":"error","error":"quota exceeded"}"#).unwrap();
        assert_eq!(event, WorkerEvent::Error("quota exceeded".to_string()));
    }

    #[test]
    fn test_decode_done_with_usage() {
        let event = decode_line(
            r#"{"type":"result","content":"final","input_tokens":1,"output_tokens":2}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            WorkerEvent::Done {
                text: Some("final".to_string()),
                usage: Some(TokenUsage::new(1, 2)),
            }
        );
    }

    #[test]
    fn test_unknown_type_with_text_degrades_to_text() {
        let event = decode_line(r#"{"type":"thinking","content":"hmm"}"#).unwrap();
        assert_eq!(event, WorkerEvent::Text("hmm".to_string()));
    }

    #[test]
    fn test_unknown_type_without_text_is_skipped() {
        assert!(decode_line(r#"{"type":"heartbeat","seq":42}"#).is_none());
    }

    #[test]
    fn test_non_record_line_is_plain_text() {
        assert_eq!(
            decode_line("not json at all").unwrap(),
            WorkerEvent::Text("not json at all".to_string())
        );
    }

    #[test]
    fn test_blank_line_is_skipped() {
        assert!(decode_line("").is_none());
        assert!(decode_line("   ").is_none());
    }

    #[test]
    fn test_assembler_joins_split_record() {
        let mut assembler = LineAssembler::new();
        let first = assembler.feed(br#"{"type":"text","con"#);
        assert!(first.is_empty());
        let second = assembler.feed(b"tent\":\"joined\"}\n");
        assert_eq!(second.len(), 1);
        assert_eq!(
            decode_line(&second[0]).unwrap(),
            WorkerEvent::Text("joined".to_string())
        );
    }

    #[test]
    fn test_assembler_multiple_lines_one_chunk() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.feed(b"one\ntwo\nthree");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(assembler.flush(), Some("three".to_string()));
        assert_eq!(assembler.flush(), None);
    }
}
