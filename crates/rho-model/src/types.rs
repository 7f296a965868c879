// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A function invocation as carried on the wire.
///
/// `arguments` is the raw JSON string exactly as the model produced it.
/// It is decoded lazily at dispatch time; history keeps the original text so
/// the conversation replays byte-identically to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

/// One tool call requested by the model, in the provider wire shape:
/// `{"id": …, "type": "function", "function": {"name": …, "arguments": …}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSpec {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCallSpec {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A single message in the conversation history.
///
/// Exactly one of `content` / `tool_calls` is populated for assistant
/// messages; `tool_call_id` is set only on tool-result messages.  Optional
/// fields are skipped on serialization so the JSON matches the provider wire
/// shape field for field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message carrying tool calls.  `content` stays `None` — the
    /// text the model streamed alongside, if any, is reported through events
    /// only, never recorded in history.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallSpec>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Character count of this message as it contributes to the context
    /// window: text content plus serialized tool-call names and arguments.
    pub fn content_chars(&self) -> usize {
        let mut chars = self.content.as_deref().map(str::len).unwrap_or(0);
        if let Some(calls) = &self.tool_calls {
            for call in calls {
                chars += call.function.name.len() + call.function.arguments.len();
            }
        }
        chars
    }
}

// ─── Prompt and tool specs ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpecFunction {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// A tool definition as sent to the model:
/// `{"type": "function", "function": {name, description, parameters}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: ToolSpecFunction,
}

impl ToolSpec {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            kind: function_kind(),
            function: ToolSpecFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// One full prompt: system text, conversation history, tool definitions.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token usage for one model call, or a session-cumulative total.
/// All counters are non-negative; `cached_tokens` and `reasoning_tokens` are
/// sub-counts reported by providers that expose them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl Usage {
    /// Accumulate a per-call delta into a running total.
    pub fn accumulate(&mut self, delta: &Usage) {
        self.input_tokens += delta.input_tokens;
        self.output_tokens += delta.output_tokens;
        self.cached_tokens += delta.cached_tokens;
        self.reasoning_tokens += delta.reasoning_tokens;
        self.cost_usd += delta.cost_usd;
    }
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// A single event streamed from the model client.
///
/// The sequence for one call is: zero or more `Text`, zero or more fully
/// assembled `ToolCall`s (partial deltas are accumulated inside the client),
/// then exactly one terminator — `Done` on success, `Error` on failure.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw JSON argument string as produced by the model.
        arguments: String,
    },
    Done {
        usage: Usage,
    },
    Error {
        message: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_message_has_content_only() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.as_deref(), Some("hello"));
        assert!(m.tool_calls.is_none());
        assert!(m.tool_call_id.is_none());
    }

    #[test]
    fn assistant_tool_calls_has_no_content() {
        let m = Message::assistant_tool_calls(vec![ToolCallSpec::new("t1", "echo", "{}")]);
        assert_eq!(m.role, Role::Assistant);
        assert!(m.content.is_none());
        assert_eq!(m.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = Message::tool_result("t1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("t1"));
        assert_eq!(m.content.as_deref(), Some("output"));
    }

    // ── Wire serialization ────────────────────────────────────────────────────

    #[test]
    fn absent_fields_are_omitted_from_json() {
        let json = serde_json::to_string(&Message::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }

    #[test]
    fn tool_call_spec_serializes_with_function_wrapper() {
        let spec = ToolCallSpec::new("id-1", "bash", r#"{"command":"ls"}"#);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""type":"function""#));
        assert!(json.contains(r#""name":"bash""#));
        assert!(json.contains(r#""arguments":"{\"command\":\"ls\"}""#));
    }

    #[test]
    fn tool_call_spec_deserializes_without_type_field() {
        let json = r#"{"id":"x","function":{"name":"f","arguments":"{}"}}"#;
        let spec: ToolCallSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, "function");
    }

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::assistant_tool_calls(vec![ToolCallSpec::new("a", "b", "{}")]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_spec_wire_shape() {
        let spec = ToolSpec::function("grep", "search", serde_json::json!({"type":"object"}));
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""type":"function""#));
        assert!(json.contains(r#""description":"search""#));
        assert_eq!(spec.name(), "grep");
    }

    // ── content_chars ─────────────────────────────────────────────────────────

    #[test]
    fn content_chars_counts_text() {
        assert_eq!(Message::user("12345678").content_chars(), 8);
    }

    #[test]
    fn content_chars_counts_tool_calls() {
        let m = Message::assistant_tool_calls(vec![ToolCallSpec::new("id", "abcd", "12345678")]);
        assert_eq!(m.content_chars(), 12);
    }

    // ── Usage accumulation ────────────────────────────────────────────────────

    #[test]
    fn usage_accumulates_all_counters() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cached_tokens: 2,
            reasoning_tokens: 1,
            cost_usd: 0.25,
        });
        total.accumulate(&Usage {
            input_tokens: 15,
            output_tokens: 3,
            ..Usage::default()
        });
        assert_eq!(total.input_tokens, 25);
        assert_eq!(total.output_tokens, 8);
        assert_eq!(total.cached_tokens, 2);
        assert_eq!(total.reasoning_tokens, 1);
        assert!((total.cost_usd - 0.25).abs() < 1e-9);
    }

    #[test]
    fn usage_deserializes_with_absent_fields() {
        let usage: Usage = serde_json::from_str(r#"{"input_tokens": 7}"#).unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.cost_usd, 0.0);
    }
}
