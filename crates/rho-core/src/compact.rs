// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rho_model::{Message, Role};

use crate::events::CompactTrigger;

/// Auto-compaction fires at this fraction of the model's context window.
pub const AUTO_COMPACT_THRESHOLD: f64 = 0.7;

pub(crate) const COMPACTION_SYSTEM_PROMPT: &str = "\
You are performing a CONTEXT CHECKPOINT COMPACTION. Create a handoff summary for another LLM that will resume the task.

Include:
- Current progress and key decisions made
- Important context, constraints, or user preferences discovered
- What remains to be done (clear next steps)
- Any critical data, file paths, or references needed to continue

Be concise, structured, and focused on helping the next LLM seamlessly continue the work.";

/// Prepended to the model-produced summary before it replaces history.
pub const SUMMARY_PREFIX: &str = "\
Another language model worked on this task and produced a summary of its progress. Use this to build on the work that has already been done and avoid duplicating effort. Here is the summary:

";

/// Tool results are clipped to this many characters in the summarization
/// prompt; full outputs would defeat the point of compacting.
const TOOL_RESULT_CLIP: usize = 500;

/// Result of one compaction pass.
#[derive(Debug, Clone)]
pub struct CompactResult {
    pub summary: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub trigger: CompactTrigger,
}

/// Serialize conversation history as plain text for the summarization prompt.
pub(crate) fn format_history_for_summary(messages: &[Message]) -> String {
    let mut parts = Vec::new();
    for msg in messages {
        match msg.role {
            Role::User => {
                if let Some(content) = &msg.content {
                    parts.push(format!("User: {content}"));
                }
            }
            Role::Assistant => {
                if let Some(content) = &msg.content {
                    parts.push(format!("Assistant: {content}"));
                }
                if let Some(calls) = &msg.tool_calls {
                    for call in calls {
                        parts.push(format!("Assistant called tool: {}", call.function.name));
                    }
                }
            }
            Role::Tool => {
                let result = msg.content.clone().unwrap_or_default();
                let clipped = if result.len() > TOOL_RESULT_CLIP {
                    let end = (0..=TOOL_RESULT_CLIP)
                        .rev()
                        .find(|&i| result.is_char_boundary(i))
                        .unwrap_or(0);
                    format!("{}...", &result[..end])
                } else {
                    result
                };
                parts.push(format!("Tool result: {clipped}"));
            }
            Role::System => {}
        }
    }
    parts.join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rho_model::ToolCallSpec;

    use super::*;

    #[test]
    fn user_and_assistant_turns_are_labelled() {
        let messages = vec![
            Message::user("what failed?"),
            Message::assistant("checking the logs"),
        ];
        let text = format_history_for_summary(&messages);
        assert!(text.contains("User: what failed?"));
        assert!(text.contains("Assistant: checking the logs"));
    }

    #[test]
    fn tool_calls_are_named_without_arguments() {
        let messages = vec![Message::assistant_tool_calls(vec![ToolCallSpec::new(
            "t1",
            "grep",
            r#"{"pattern":"secret"}"#,
        )])];
        let text = format_history_for_summary(&messages);
        assert!(text.contains("Assistant called tool: grep"));
        assert!(
            !text.contains("secret"),
            "arguments must not leak into the summary prompt"
        );
    }

    #[test]
    fn long_tool_results_are_clipped() {
        let messages = vec![Message::tool_result("t1", "x".repeat(2_000))];
        let text = format_history_for_summary(&messages);
        assert!(text.contains("Tool result: "));
        assert!(text.ends_with("..."));
        assert!(text.len() < 600);
    }

    #[test]
    fn system_messages_are_excluded() {
        let messages = vec![Message::system("internal marker"), Message::user("hi")];
        let text = format_history_for_summary(&messages);
        assert!(!text.contains("internal marker"));
    }

    #[test]
    fn empty_history_is_empty_text() {
        assert_eq!(format_history_for_summary(&[]), "");
    }
}
