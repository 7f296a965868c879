// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! State — the accumulating record of one conversation.
//!
//! State is the trajectory: messages, cumulative usage, status, run count.
//! It is the single source of truth — serializable, observable, and
//! inspectable without a session.  When `trace_path` is set, every mutation
//! is appended to a JSONL file immediately (flush after write) so the trace
//! survives a crash without an explicit save step.  Observers are opt-in
//! mirrors; the trace file is the primary durable record.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rho_model::{Message, ToolCallSpec, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Cancelled,
    Error,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Observer notified on every state mutation.
///
/// Observers are best-effort: a returned error is counted and logged at
/// debug level, never propagated — the trace file stays authoritative.
pub trait StateObserver: Send + Sync {
    fn on_event(&self, event: &Value) -> anyhow::Result<()>;
}

pub struct State {
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub status: SessionStatus,
    pub run_count: u32,
    trace_path: Option<PathBuf>,
    observers: Vec<Arc<dyn StateObserver>>,
    observer_errors: u64,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            usage: Usage::default(),
            status: SessionStatus::Created,
            run_count: 0,
            trace_path: None,
            observers: Vec::new(),
            observer_errors: 0,
        }
    }

    /// Enable incremental JSONL tracing to `path` (append mode).
    pub fn set_trace_path(&mut self, path: PathBuf) {
        self.trace_path = Some(path);
    }

    pub fn trace_path(&self) -> Option<&PathBuf> {
        self.trace_path.as_ref()
    }

    pub fn add_observer(&mut self, observer: Arc<dyn StateObserver>) {
        self.observers.push(observer);
    }

    /// Number of swallowed observer failures, surfaced for debug tooling.
    pub fn observer_errors(&self) -> u64 {
        self.observer_errors
    }

    // ── Event recording ───────────────────────────────────────────────────────

    /// Write an event to the trace file and notify observers.
    ///
    /// Serialization or I/O failures are swallowed per line: the in-memory
    /// state remains authoritative even if the file trace is incomplete.
    pub fn emit(&mut self, mut event: Value) {
        if let Some(obj) = event.as_object_mut() {
            if !obj.contains_key("ts") {
                obj.insert("ts".into(), json!(Utc::now().to_rfc3339()));
            }
        }
        if let Some(path) = &self.trace_path {
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| {
                    writeln!(f, "{event}")?;
                    f.flush()
                });
            if let Err(e) = result {
                debug!(error = %e, path = %path.display(), "trace write failed");
            }
        }
        for observer in &self.observers {
            if let Err(e) = observer.on_event(&event) {
                self.observer_errors += 1;
                debug!(error = %e, "state observer failed");
            }
        }
    }

    fn emit_message(&mut self, msg: &Message) {
        let mut event = json!({"type": "message"});
        if let (Some(obj), Ok(Value::Object(fields))) =
            (event.as_object_mut(), serde_json::to_value(msg))
        {
            obj.extend(fields);
        }
        self.emit(event);
    }

    // ── Message manipulation ──────────────────────────────────────────────────

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        let msg = Message::user(content);
        self.messages.push(msg.clone());
        self.emit_message(&msg);
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        let msg = Message::assistant(content);
        self.messages.push(msg.clone());
        self.emit_message(&msg);
    }

    pub fn add_assistant_tool_calls(&mut self, tool_calls: Vec<ToolCallSpec>) {
        let msg = Message::assistant_tool_calls(tool_calls);
        self.messages.push(msg.clone());
        self.emit_message(&msg);
    }

    pub fn add_tool_result(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        let msg = Message::tool_result(tool_call_id, content);
        self.messages.push(msg.clone());
        self.emit_message(&msg);
    }

    pub fn add_system_message(&mut self, content: impl Into<String>) {
        let msg = Message::system(content);
        self.messages.push(msg.clone());
        self.emit_message(&msg);
    }

    // ── Usage tracking ────────────────────────────────────────────────────────

    pub fn update_usage(&mut self, delta: &Usage) {
        self.usage.accumulate(delta);
    }

    // ── Read views ────────────────────────────────────────────────────────────

    pub fn get_messages(&self) -> &[Message] {
        &self.messages
    }

    /// All user message texts, in order.
    pub fn get_user_messages(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.role == rho_model::Role::User)
            .filter_map(|m| m.content.clone())
            .collect()
    }

    /// Rough token estimate (4 chars ≈ 1 token) over the system prompt plus
    /// every message's content and serialized tool calls.  Used only for
    /// pre-call compaction decisions; the measured prompt-token count from
    /// the provider is preferred once available.
    pub fn estimate_tokens(&self, system_prompt: &str) -> u64 {
        let chars: usize = system_prompt.len()
            + self
                .messages
                .iter()
                .map(Message::content_chars)
                .sum::<usize>();
        (chars / 4) as u64
    }

    // ── Compaction primitive ──────────────────────────────────────────────────

    /// Replace history with a compacted summary.
    ///
    /// Recent user messages come first so the chronological prefix remains
    /// plausible; the summary follows as the most recent context.
    pub fn replace_with_summary(&mut self, summary: String, recent_user_messages: Vec<String>) {
        self.messages.clear();
        for content in recent_user_messages {
            self.messages.push(Message::user(content));
        }
        self.messages.push(Message::user(summary));
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    /// Serialize to JSONL bytes: one `message` record per message, then a
    /// final `usage` record carrying totals, status, and run count.
    pub fn to_jsonl(&self) -> anyhow::Result<Vec<u8>> {
        let mut lines = Vec::with_capacity(self.messages.len() + 1);
        for msg in &self.messages {
            let mut event = serde_json::Map::new();
            event.insert("type".into(), json!("message"));
            if let Value::Object(fields) = serde_json::to_value(msg)? {
                event.extend(fields);
            }
            lines.push(serde_json::to_string(&Value::Object(event))?);
        }
        let mut usage = serde_json::Map::new();
        usage.insert("type".into(), json!("usage"));
        if let Value::Object(fields) = serde_json::to_value(self.usage)? {
            usage.extend(fields);
        }
        usage.insert("status".into(), json!(self.status.as_str()));
        usage.insert("run_count".into(), json!(self.run_count));
        lines.push(serde_json::to_string(&Value::Object(usage))?);

        let mut bytes = lines.join("\n").into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize from JSONL bytes.  Unknown record types and absent
    /// fields are tolerated, so a live trace file (which carries extra
    /// event kinds) replays into a State as well.
    pub fn from_jsonl(data: &[u8]) -> anyhow::Result<Self> {
        let mut state = State::new();
        let text = std::str::from_utf8(data)?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut event: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => continue, // tolerate a torn final line
            };
            let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
            match kind {
                "message" => {
                    if let Some(obj) = event.as_object_mut() {
                        obj.remove("type");
                        obj.remove("ts");
                    }
                    if let Ok(msg) = serde_json::from_value::<Message>(event) {
                        state.messages.push(msg);
                    }
                }
                "usage" => {
                    state.usage = serde_json::from_value(event.clone()).unwrap_or_default();
                    state.status = event
                        .get("status")
                        .and_then(Value::as_str)
                        .and_then(|s| serde_json::from_value(json!(s)).ok())
                        .unwrap_or(SessionStatus::Completed);
                    state.run_count = event
                        .get("run_count")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as u32;
                }
                _ => {}
            }
        }
        Ok(state)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    // ── Message manipulation ──────────────────────────────────────────────────

    #[test]
    fn messages_append_in_order() {
        let mut state = State::new();
        state.add_user_message("q");
        state.add_assistant_message("a");
        state.add_tool_result("t1", "r");
        let roles: Vec<_> = state.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                rho_model::Role::User,
                rho_model::Role::Assistant,
                rho_model::Role::Tool
            ]
        );
    }

    #[test]
    fn get_user_messages_extracts_in_order() {
        let mut state = State::new();
        state.add_user_message("one");
        state.add_assistant_message("reply");
        state.add_user_message("two");
        assert_eq!(state.get_user_messages(), vec!["one", "two"]);
    }

    #[test]
    fn usage_accumulates_monotonically() {
        let mut state = State::new();
        state.update_usage(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            ..Usage::default()
        });
        state.update_usage(&Usage {
            input_tokens: 7,
            output_tokens: 3,
            cost_usd: 0.1,
            ..Usage::default()
        });
        assert_eq!(state.usage.input_tokens, 17);
        assert_eq!(state.usage.output_tokens, 8);
    }

    // ── Token estimation ──────────────────────────────────────────────────────

    #[test]
    fn estimate_counts_system_prompt_and_messages() {
        let mut state = State::new();
        state.add_user_message("12345678"); // 8 chars
        // 8 system chars + 8 message chars = 16 chars → 4 tokens
        assert_eq!(state.estimate_tokens("abcdefgh"), 4);
    }

    #[test]
    fn estimate_includes_tool_call_arguments() {
        let mut state = State::new();
        state.add_assistant_tool_calls(vec![ToolCallSpec::new("id", "abcd", "12345678")]);
        // 4 + 8 = 12 chars → 3 tokens
        assert_eq!(state.estimate_tokens(""), 3);
    }

    // ── Compaction primitive ──────────────────────────────────────────────────

    #[test]
    fn replace_with_summary_orders_recent_before_summary() {
        let mut state = State::new();
        state.add_user_message("old one");
        state.add_assistant_message("reply");
        state.add_user_message("old two");
        state.replace_with_summary(
            "SUMMARY".into(),
            vec!["recent a".into(), "recent b".into()],
        );
        let contents: Vec<_> = state
            .messages
            .iter()
            .map(|m| m.content.clone().unwrap())
            .collect();
        assert_eq!(contents, vec!["recent a", "recent b", "SUMMARY"]);
    }

    #[test]
    fn summary_shrinks_estimate() {
        let mut state = State::new();
        for _ in 0..50 {
            state.add_user_message("a long message with plenty of characters in it");
        }
        let before = state.estimate_tokens("");
        state.replace_with_summary("short".into(), vec![]);
        assert!(state.estimate_tokens("") < before);
    }

    // ── JSONL round trip ──────────────────────────────────────────────────────

    #[test]
    fn jsonl_round_trip_preserves_everything() {
        let mut state = State::new();
        state.add_user_message("question");
        state.add_assistant_tool_calls(vec![ToolCallSpec::new("t1", "bash", r#"{"command":"ls"}"#)]);
        state.add_tool_result("t1", "listing");
        state.add_assistant_message("answer");
        state.usage = Usage {
            input_tokens: 100,
            output_tokens: 40,
            cached_tokens: 10,
            reasoning_tokens: 5,
            cost_usd: 0.02,
        };
        state.status = SessionStatus::Completed;
        state.run_count = 3;

        let bytes = state.to_jsonl().unwrap();
        let restored = State::from_jsonl(&bytes).unwrap();

        assert_eq!(restored.messages, state.messages);
        assert_eq!(restored.usage, state.usage);
        assert_eq!(restored.status, state.status);
        assert_eq!(restored.run_count, 3);
    }

    #[test]
    fn from_jsonl_tolerates_absent_fields_and_junk() {
        let data = b"{\"type\":\"message\",\"role\":\"user\",\"content\":\"hi\"}\n\
                     {\"type\":\"llm_start\",\"model\":\"x\"}\n\
                     not json at all\n\
                     {\"type\":\"usage\"}\n";
        let state = State::from_jsonl(data).unwrap();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.usage.input_tokens, 0);
        assert_eq!(state.status, SessionStatus::Completed);
    }

    // ── Trace file ────────────────────────────────────────────────────────────

    #[test]
    fn trace_file_gets_one_line_per_event_with_ts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let mut state = State::new();
        state.set_trace_path(path.clone());
        state.add_user_message("hello");
        state.add_assistant_message("world");

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["type"], "message");
            assert!(v["ts"].is_string(), "every event carries a timestamp");
        }
    }

    #[test]
    fn trace_file_replays_into_equal_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");
        let mut state = State::new();
        state.set_trace_path(path.clone());
        state.add_user_message("q");
        state.add_assistant_message("a");

        let bytes = std::fs::read(&path).unwrap();
        let restored = State::from_jsonl(&bytes).unwrap();
        assert_eq!(restored.messages, state.messages);
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    struct CountingObserver {
        count: AtomicUsize,
        last: Mutex<Option<Value>>,
    }

    impl StateObserver for CountingObserver {
        fn on_event(&self, event: &Value) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(event.clone());
            Ok(())
        }
    }

    struct FailingObserver;

    impl StateObserver for FailingObserver {
        fn on_event(&self, _event: &Value) -> anyhow::Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    #[test]
    fn observers_see_every_mutation() {
        let observer = Arc::new(CountingObserver {
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let mut state = State::new();
        state.add_observer(observer.clone());
        state.add_user_message("one");
        state.add_assistant_message("two");
        assert_eq!(observer.count.load(Ordering::SeqCst), 2);
        let last = observer.last.lock().unwrap().clone().unwrap();
        assert_eq!(last["content"], "two");
    }

    #[test]
    fn failing_observer_is_swallowed_and_counted() {
        let mut state = State::new();
        state.add_observer(Arc::new(FailingObserver));
        state.add_user_message("still works");
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.observer_errors(), 1);
    }
}
