// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single tool invocation requested by the model, in decoded form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Opaque identifier from the model, forwarded verbatim into the result.
    pub call_id: String,
    pub tool_name: String,
    /// Decoded JSON argument object.
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// String argument accessor, trimmed; `None` when absent or non-string.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }

    pub fn bool_arg(&self, key: &str) -> Option<bool> {
        self.arguments.get(key).and_then(Value::as_bool)
    }

    pub fn u64_arg(&self, key: &str) -> Option<u64> {
        self.arguments.get(key).and_then(Value::as_u64)
    }
}

/// The result of executing a tool.
///
/// `metadata` carries tool-specific counters (rows, lines, exit_code,
/// duration) consumed by display summarizers and telemetry; it is never sent
/// to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: Map::new(),
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Marker error for cooperative cancellation.
///
/// A handler that observes cancellation mid-call returns this; the registry
/// propagates it upward instead of converting it into a failure output, so
/// the agent loop terminates the run rather than feeding the model a
/// spurious tool error.
#[derive(Debug, thiserror::Error)]
#[error("tool execution cancelled")]
pub struct Cancelled;

/// Trait every tool implements.  Tools may hold long-lived resources
/// (connection pools, sandbox handles); the host imposes no per-call
/// lifecycle.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Stable identifier used in tool specs and dispatch.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the parameters object.
    fn parameters(&self) -> Value;

    /// Whether invocations must pass the approval gate.
    fn requires_approval(&self) -> bool {
        false
    }

    /// Disabled tools are absent from specs and rejected by dispatch.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Execute the tool.  Failures should be reported as
    /// `Ok(ToolOutput { success: false, .. })` where the model can usefully
    /// self-correct; `Err` is reserved for faults the registry wraps (and
    /// for [`Cancelled`], which propagates).
    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_output_ok_sets_success() {
        let out = ToolOutput::ok("fine");
        assert!(out.success);
        assert_eq!(out.content, "fine");
        assert!(out.metadata.is_empty());
    }

    #[test]
    fn tool_output_err_clears_success() {
        assert!(!ToolOutput::err("broke").success);
    }

    #[test]
    fn with_metadata_attaches_counters() {
        let mut meta = Map::new();
        meta.insert("rows".into(), json!(3));
        let out = ToolOutput::ok("x").with_metadata(meta);
        assert_eq!(out.metadata["rows"], json!(3));
    }

    #[test]
    fn invocation_arg_accessors() {
        let mut args = Map::new();
        args.insert("path".into(), json!("/tmp/x"));
        args.insert("all".into(), json!(true));
        args.insert("limit".into(), json!(40));
        let inv = ToolInvocation::new("c1", "read_file", args);
        assert_eq!(inv.str_arg("path"), Some("/tmp/x"));
        assert_eq!(inv.bool_arg("all"), Some(true));
        assert_eq!(inv.u64_arg("limit"), Some(40));
        assert_eq!(inv.str_arg("missing"), None);
    }

    #[test]
    fn cancelled_is_detectable_through_anyhow() {
        let err: anyhow::Error = Cancelled.into();
        assert!(err.is::<Cancelled>());
    }
}
