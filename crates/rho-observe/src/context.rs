// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Session-scoped telemetry accumulator.
#[derive(Debug, Clone)]
pub struct TelemetryContext {
    pub session_id: String,
    pub model: String,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    pub turn_index: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_reasoning_tokens: u64,
    pub tool_calls: u64,
    /// Last observed prompt-token count.
    pub context_size: u64,
    /// Free-form counters; telemetry degradation flags land here.
    pub metadata: Map<String, Value>,
}

impl TelemetryContext {
    pub fn new(session_id: &str, model: &str, profile: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            model: model.to_string(),
            profile: profile.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: "running".into(),
            turn_index: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_reasoning_tokens: 0,
            tool_calls: 0,
            context_size: 0,
            metadata: Map::new(),
        }
    }

    /// Begin a new turn and return its id.
    pub fn start_turn(&mut self) -> String {
        self.turn_index += 1;
        Uuid::new_v4().to_string()
    }

    pub fn record_tokens(&mut self, input: u64, output: u64, reasoning: u64) {
        self.total_input_tokens += input;
        self.total_output_tokens += output;
        self.total_reasoning_tokens += reasoning;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn end_session(&mut self, status: &str) {
        self.status = status.to_string();
        self.ended_at = Some(Utc::now());
    }
}

/// One turn's telemetry record.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub turn_id: String,
    pub session_id: String,
    pub turn_index: u32,
    pub user_input: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub context_size: u64,
}

impl TurnContext {
    pub fn new(turn_id: String, session_id: &str, turn_index: u32, user_input: &str) -> Self {
        Self {
            turn_id,
            session_id: session_id.to_string(),
            turn_index,
            user_input: user_input.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            context_size: 0,
        }
    }

    pub fn end(&mut self) {
        self.ended_at = Some(Utc::now());
    }
}

/// One tool execution's telemetry record.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub execution_id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl ToolExecutionContext {
    pub fn new(turn_id: &str, tool_name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            turn_id: turn_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            started_at: Utc::now(),
            ended_at: None,
            success: false,
            error: None,
            result: None,
        }
    }

    pub fn end(&mut self, success: bool, error: Option<&str>) {
        self.ended_at = Some(Utc::now());
        self.success = success;
        self.error = error.map(str::to_string);
    }

    pub fn duration_ms(&self) -> i64 {
        match self.ended_at {
            Some(end) => (end - self.started_at).num_milliseconds(),
            None => 0,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_turn_increments_index_and_generates_unique_ids() {
        let mut ctx = TelemetryContext::new("s", "m", "readonly");
        let a = ctx.start_turn();
        let b = ctx.start_turn();
        assert_ne!(a, b);
        assert_eq!(ctx.turn_index, 2);
    }

    #[test]
    fn record_tokens_accumulates() {
        let mut ctx = TelemetryContext::new("s", "m", "readonly");
        ctx.record_tokens(100, 20, 5);
        ctx.record_tokens(50, 10, 0);
        assert_eq!(ctx.total_input_tokens, 150);
        assert_eq!(ctx.total_output_tokens, 30);
        assert_eq!(ctx.total_reasoning_tokens, 5);
    }

    #[test]
    fn end_session_stamps_status_and_time() {
        let mut ctx = TelemetryContext::new("s", "m", "readonly");
        ctx.end_session("completed");
        assert_eq!(ctx.status, "completed");
        assert!(ctx.ended_at.is_some());
    }

    #[test]
    fn tool_execution_end_records_outcome() {
        let mut exec = ToolExecutionContext::new("turn", "bash", Map::new());
        exec.end(false, Some("Blocked by user"));
        assert!(!exec.success);
        assert_eq!(exec.error.as_deref(), Some("Blocked by user"));
        assert!(exec.duration_ms() >= 0);
    }
}
