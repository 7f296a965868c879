// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rho_model::{Message, Usage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tool call awaiting an out-of-band approval decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalItem {
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_args: Map<String, Value>,
}

/// Serializable snapshot of an interrupted run.
///
/// Captures everything needed to resume in a fresh process: conversation
/// history, usage totals, and the frozen tool calls still awaiting a
/// decision.  The pending calls live here rather than in history, so the
/// history invariant (every tool-call message is followed by its results)
/// holds across the interruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub session_id: String,
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub usage: Usage,
    #[serde(default)]
    pub last_input_tokens: u64,
    #[serde(default)]
    pub pending_approvals: Vec<ToolApprovalItem>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
