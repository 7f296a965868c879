// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rho_model::Usage;
use serde_json::{Map, Value};

/// What initiated a compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactTrigger {
    Auto,
    Manual,
}

impl CompactTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Cumulative session totals reported on `turn_complete`.
///
/// `context_size` is the last *measured* prompt-token count from the
/// provider, not the character-based estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurnTotals {
    pub usage: Usage,
    pub context_size: u64,
}

/// Exit status of one `Session::run` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Error,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Events emitted by the session during a single run.
///
/// Ordering guarantees within a run: a tool's `ToolEnd` never precedes its
/// `ToolStart`; the final event is always one of `TurnComplete`, `Error`,
/// `Cancelled`, or `Interruption`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Incremental completion text from the model.
    Text {
        content: String,
    },
    /// The model requested a tool call (fully assembled).
    ToolStart {
        tool_name: String,
        tool_call_id: String,
        tool_args: Map<String, Value>,
    },
    /// A tool invocation finished; `tool_result` is the (possibly
    /// truncated) content recorded in history, `tool_metadata` the tool's
    /// counters.
    ToolEnd {
        tool_name: String,
        tool_call_id: String,
        tool_result: String,
        tool_metadata: Map<String, Value>,
    },
    /// The user rejected an approval-gated call.
    ToolBlocked {
        tool_name: String,
        tool_call_id: String,
    },
    /// One model API call finished; `usage` is the per-call delta.
    ApiCallComplete {
        usage: Usage,
        call_index: u32,
    },
    /// The run finished; carries cumulative session totals.
    TurnComplete {
        totals: TurnTotals,
    },
    CompactStart {
        trigger: CompactTrigger,
    },
    CompactEnd {
        message: String,
    },
    /// The run paused for out-of-band tool approval; the pending calls are
    /// carried in the returned `RunState`, not in history.
    Interruption {
        tool_name: String,
        tool_call_id: String,
    },
    Cancelled {
        reason: String,
    },
    Error {
        message: String,
    },
}
