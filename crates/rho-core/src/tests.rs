// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the agent loop.
///
/// Uses `ScriptedMockClient` so every scenario is deterministic and needs
/// no network access.
#[cfg(test)]
mod session_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use rho_config::AgentConfig;
    use rho_model::{Role, ScriptedMockClient, StreamEvent, Usage};
    use rho_tools::{ToolHandler, ToolInvocation, ToolOutput, ToolRegistry};
    use serde_json::{json, Value};

    use crate::{
        Agent, AgentEvent, ApprovalCallback, ApprovalDecision, DelegateTool, RunStatus, Session,
        State,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct EchoTool {
        approval: bool,
    }

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its text argument"
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        fn requires_approval(&self) -> bool {
            self.approval
        }
        async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::ok(
                invocation.str_arg("text").unwrap_or_default().to_string(),
            ))
        }
    }

    fn test_agent() -> Arc<Agent> {
        let config = AgentConfig {
            system_prompt: "You are a test harness agent.".into(),
            model: "test-model".into(), // not in the catalog: no auto context window
            profile: "readonly".into(),
            working_dir: Some("/tmp".into()),
            ..AgentConfig::default()
        };
        Arc::new(Agent::new(config).unwrap())
    }

    /// Session over a scripted client whose registry contains exactly one
    /// echo tool.
    fn echo_session(client: ScriptedMockClient, approval: bool) -> Session {
        let agent = test_agent();
        let mut session = Session::with_client(agent, Arc::new(client));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { approval });
        session.set_registry(Arc::new(registry));
        session
    }

    fn always(decision: ApprovalDecision) -> ApprovalCallback {
        Arc::new(move |_name, _args| Box::pin(async move { Ok(decision) }))
    }

    /// Approval callback that counts invocations before approving.
    fn counting_approval(counter: Arc<AtomicUsize>) -> ApprovalCallback {
        Arc::new(move |_name, _args| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ApprovalDecision::Approve)
            })
        })
    }

    /// Check the tool-call/result pairing invariant: every assistant
    /// tool-calls message is followed by exactly one tool result per call
    /// id, before the next assistant message.
    fn assert_history_invariant(state: &State) {
        let messages = state.get_messages();
        let mut i = 0;
        while i < messages.len() {
            if let Some(calls) = &messages[i].tool_calls {
                let mut expected: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
                for j in 0..calls.len() {
                    let result = &messages[i + 1 + j];
                    assert_eq!(result.role, Role::Tool, "tool result expected at {}", i + 1 + j);
                    let id = result.tool_call_id.as_deref().unwrap();
                    let pos = expected
                        .iter()
                        .position(|e| *e == id)
                        .unwrap_or_else(|| panic!("unexpected tool result id {id}"));
                    expected.remove(pos);
                }
                assert!(expected.is_empty(), "missing results for {expected:?}");
                i += 1 + calls.len();
            } else {
                i += 1;
            }
        }
    }

    fn two_tool_calls_script() -> Vec<Vec<StreamEvent>> {
        vec![vec![
            StreamEvent::ToolCall {
                id: "t1".into(),
                name: "echo".into(),
                arguments: r#"{"text":"first"}"#.into(),
            },
            StreamEvent::ToolCall {
                id: "t2".into(),
                name: "echo".into(),
                arguments: r#"{"text":"second"}"#.into(),
            },
            StreamEvent::Done {
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Usage::default()
                },
            },
        ]]
    }

    // ── Scenario: tool call then text ─────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_then_text_completes_with_four_messages() {
        let client = ScriptedMockClient::tool_then_text("t1", "echo", r#"{"text":"hi"}"#, "Done!");
        let mut session = echo_session(client, false);

        let result = session.run("start").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.text, "Done!");
        assert_eq!(result.usage.usage.input_tokens, 25);
        assert_eq!(result.usage.usage.output_tokens, 8);

        let messages = session.state().get_messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[1].tool_calls.is_some());
        assert_eq!(messages[2].role, Role::Tool);
        assert_eq!(messages[2].content.as_deref(), Some("hi"));
        assert_eq!(messages[3].content.as_deref(), Some("Done!"));
        assert_history_invariant(session.state());
    }

    #[tokio::test]
    async fn events_are_ordered_and_terminated_by_turn_complete() {
        let client = ScriptedMockClient::tool_then_text("t1", "echo", r#"{"text":"x"}"#, "ok");
        let mut session = echo_session(client, false);
        let result = session.run("go").await;

        let start_pos = result
            .events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolStart { .. }))
            .unwrap();
        let end_pos = result
            .events
            .iter()
            .position(|e| matches!(e, AgentEvent::ToolEnd { .. }))
            .unwrap();
        assert!(start_pos < end_pos, "ToolEnd must follow its ToolStart");
        assert!(
            matches!(result.events.last(), Some(AgentEvent::TurnComplete { .. })),
            "last event must be TurnComplete"
        );
    }

    #[tokio::test]
    async fn live_event_channel_mirrors_collected_events() {
        let client = ScriptedMockClient::always_text("streamed");
        let mut session = echo_session(client, false);
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);

        let result = session
            .run_with_options(
                "hi",
                crate::RunOptions {
                    events_tx: Some(tx),
                    ..Default::default()
                },
            )
            .await;

        let mut mirrored = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            mirrored.push(ev);
        }
        assert_eq!(mirrored.len(), result.events.len());
    }

    // ── Scenario: approval rejection ──────────────────────────────────────────

    #[tokio::test]
    async fn rejection_records_canned_results_and_skips_the_rest() {
        let client = ScriptedMockClient::new(two_tool_calls_script());
        let mut session = echo_session(client, true);
        session.set_approval_callback(Some(always(ApprovalDecision::Reject)));

        let result = session.run("run both").await;

        assert_eq!(result.status, RunStatus::Completed);
        let messages = session.state().get_messages();
        let results: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_deref().unwrap())
            .collect();
        assert_eq!(
            results,
            vec![
                "Command rejected by user. Awaiting new instructions.",
                "Command skipped - user rejected previous command.",
            ]
        );
        assert!(
            !result.text.contains("no more scripts"),
            "no further model call may happen after a rejection"
        );
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolBlocked { tool_call_id, .. } if tool_call_id == "t1")));
        assert_history_invariant(session.state());
    }

    #[tokio::test]
    async fn approval_callback_not_invoked_for_ungated_tools() {
        let counter = Arc::new(AtomicUsize::new(0));
        let client = ScriptedMockClient::tool_then_text("t1", "echo", r#"{"text":"x"}"#, "ok");
        let mut session = echo_session(client, false);
        session.set_approval_callback(Some(counting_approval(Arc::clone(&counter))));

        let result = session.run("go").await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approval_callback_gates_dangerous_tools() {
        let counter = Arc::new(AtomicUsize::new(0));
        let client = ScriptedMockClient::tool_then_text("t1", "echo", r#"{"text":"x"}"#, "ok");
        let mut session = echo_session(client, true);
        session.set_approval_callback(Some(counting_approval(Arc::clone(&counter))));

        let result = session.run("go").await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    // ── Scenario: approval interrupt then resume ──────────────────────────────

    #[tokio::test]
    async fn interrupt_freezes_pending_calls_into_run_state() {
        let client = ScriptedMockClient::new(two_tool_calls_script());
        let mut session = echo_session(client, true);
        session.set_approval_callback(Some(always(ApprovalDecision::Interrupt)));

        let result = session.run("run both").await;

        assert_eq!(result.status, RunStatus::Interrupted);
        assert_eq!(result.interruptions.len(), 2);
        assert_eq!(result.interruptions[0].tool_call_id, "t1");
        assert_eq!(result.interruptions[1].tool_call_id, "t2");

        let snapshot = result.state.expect("interrupted run must carry state");
        assert_eq!(snapshot.pending_approvals.len(), 2);
        // No tool results yet; the assistant tool-calls message is the tail.
        let messages = session.state().get_messages();
        assert!(messages.last().unwrap().tool_calls.is_some());
        assert!(!messages.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn resume_with_approvals_executes_frozen_calls_without_callback() {
        // First run: interrupt on t1.
        let client = ScriptedMockClient::new(two_tool_calls_script());
        let mut session = echo_session(client, true);
        session.set_approval_callback(Some(always(ApprovalDecision::Interrupt)));
        let first = session.run("run both").await;
        let snapshot = first.state.unwrap();

        // Second run, fresh session (out-of-band approval flow): decisions
        // short-circuit the callback, which must never fire.
        let mut resumed = echo_session(ScriptedMockClient::always_text("ok"), true);
        let counter = Arc::new(AtomicUsize::new(0));
        resumed.set_approval_callback(Some(counting_approval(Arc::clone(&counter))));

        let mut decisions = HashMap::new();
        decisions.insert("t1".to_string(), true);
        decisions.insert("t2".to_string(), true);
        let result = resumed.resume(snapshot, decisions).await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.text, "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 0, "callback must be bypassed");

        let messages = resumed.state().get_messages();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(messages[2].content.as_deref(), Some("first"));
        assert_eq!(messages[3].content.as_deref(), Some("second"));
        assert_history_invariant(resumed.state());
    }

    #[tokio::test]
    async fn resume_with_denied_first_call_rejects_and_skips() {
        let client = ScriptedMockClient::new(two_tool_calls_script());
        let mut session = echo_session(client, true);
        session.set_approval_callback(Some(always(ApprovalDecision::Interrupt)));
        let snapshot = session.run("run both").await.state.unwrap();

        let mut resumed = echo_session(ScriptedMockClient::always_text("unused"), true);
        let mut decisions = HashMap::new();
        decisions.insert("t1".to_string(), false);
        let result = resumed.resume(snapshot, decisions).await;

        assert_eq!(result.status, RunStatus::Completed);
        let results: Vec<&str> = resumed
            .state()
            .get_messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.as_deref().unwrap())
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].contains("rejected"));
        assert!(results[1].contains("skipped"));
        assert!(
            !result.text.contains("unused"),
            "no model call may follow a rejection"
        );
        assert_history_invariant(resumed.state());
    }

    // ── Scenario: cancellation ────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_before_model_call_stops_immediately() {
        let client = ScriptedMockClient::always_text("never seen");
        let mut session = echo_session(client, false);
        session.set_cancel_check(Some(Arc::new(|| true)));

        let result = session.run("hello").await;

        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.text.is_empty());
        assert_eq!(result.events.len(), 1);
        assert!(matches!(result.events[0], AgentEvent::Cancelled { .. }));
        // Only the user input was recorded.
        let messages = session.state().get_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn session_is_reusable_after_cancellation() {
        use std::sync::atomic::AtomicBool;

        let client = ScriptedMockClient::always_text("second run answer");
        let mut session = echo_session(client, false);
        // External cancel signal that fires exactly once.
        let pending_cancel = Arc::new(AtomicBool::new(true));
        let check = Arc::clone(&pending_cancel);
        session.set_cancel_check(Some(Arc::new(move || check.swap(false, Ordering::SeqCst))));

        let first = session.run("one").await;
        assert_eq!(first.status, RunStatus::Cancelled);

        // The latch resets at the next run; the signal is gone.
        let second = session.run("two").await;
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.text, "second run answer");
    }

    #[tokio::test]
    async fn pause_with_cancel_does_not_deadlock() {
        let client = ScriptedMockClient::always_text("x");
        let mut session = echo_session(client, false);
        session.set_pause_check(Some(Arc::new(|| true)));
        session.set_cancel_check(Some(Arc::new(|| true)));

        let result = session.run("hi").await;
        assert_eq!(result.status, RunStatus::Cancelled);
    }

    // ── Scenario: auto-compaction ─────────────────────────────────────────────

    #[tokio::test]
    async fn auto_compaction_fires_before_the_model_call() {
        let client = ScriptedMockClient::always_text("reply after compaction");
        client.push_complete(
            "summary of prior work",
            Usage {
                input_tokens: 50,
                output_tokens: 10,
                ..Usage::default()
            },
        );

        let mut state = State::new();
        for i in 0..5 {
            state.add_user_message(format!("user message {i} {}", "x".repeat(100)));
            state.add_assistant_message(format!("assistant reply {i} {}", "y".repeat(100)));
        }
        let agent = test_agent();
        let mut session = Session::with_client_and_state(agent, Arc::new(client), state);
        session.set_registry(Arc::new(ToolRegistry::new()));
        session.context_window = Some(100); // estimate is far above 70 tokens

        let result = session.run("more").await;

        assert_eq!(result.status, RunStatus::Completed);
        let kinds: Vec<&AgentEvent> = result.events.iter().collect();
        assert!(matches!(kinds[0], AgentEvent::CompactStart { .. }));
        assert!(matches!(kinds[1], AgentEvent::CompactEnd { .. }));

        // History: 3 recent user messages + summary + new input + reply.
        let messages = session.state().get_messages();
        assert_eq!(messages.len(), 6);
        assert!(messages[3]
            .content
            .as_deref()
            .unwrap()
            .contains("summary of prior work"));
        assert_eq!(messages[4].content.as_deref(), Some("more"));
        assert_eq!(
            messages[5].content.as_deref(),
            Some("reply after compaction")
        );
    }

    #[tokio::test]
    async fn compaction_failure_leaves_history_intact() {
        struct FailingCompleteClient;
        #[async_trait]
        impl rho_model::ModelClient for FailingCompleteClient {
            fn model(&self) -> &str {
                "failing"
            }
            async fn stream(&self, _prompt: rho_model::Prompt) -> rho_model::EventStream {
                Box::pin(futures::stream::iter(vec![]))
            }
            async fn complete(
                &self,
                _messages: Vec<rho_model::Message>,
            ) -> anyhow::Result<(String, Usage)> {
                anyhow::bail!("summarizer unavailable")
            }
        }

        let mut state = State::new();
        for _ in 0..10 {
            state.add_user_message("z".repeat(100));
        }
        let before = state.get_messages().len();
        let agent = test_agent();
        let mut session =
            Session::with_client_and_state(agent, Arc::new(FailingCompleteClient), state);
        session.set_registry(Arc::new(ToolRegistry::new()));
        session.context_window = Some(100);

        let result = session.run("next").await;

        assert_eq!(result.status, RunStatus::Error);
        assert!(matches!(result.events.last(), Some(AgentEvent::Error { .. })));
        // Compaction never ran: the seeded messages are still there.
        assert_eq!(session.state().get_messages().len(), before);
    }

    #[tokio::test]
    async fn usage_is_monotonic_across_compaction() {
        let client = ScriptedMockClient::always_text("done");
        client.push_complete("sum", Usage {
            input_tokens: 5,
            output_tokens: 5,
            ..Usage::default()
        });
        let mut state = State::new();
        for _ in 0..10 {
            state.add_user_message("w".repeat(100));
        }
        let agent = test_agent();
        let mut session = Session::with_client_and_state(agent, Arc::new(client), state);
        session.set_registry(Arc::new(ToolRegistry::new()));
        session.context_window = Some(100);

        let before = session.state().usage;
        let result = session.run("q").await;
        assert_eq!(result.status, RunStatus::Completed);
        let after = session.state().usage;
        assert!(after.input_tokens + after.output_tokens
            >= before.input_tokens + before.output_tokens);
    }

    // ── Model errors ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_error_ends_the_run_with_error_status() {
        let client = ScriptedMockClient::new(vec![vec![
            StreamEvent::Text {
                content: "partial ".into(),
            },
            StreamEvent::Error {
                message: "rate limited".into(),
            },
        ]]);
        let mut session = echo_session(client, false);

        let result = session.run("hello").await;

        assert_eq!(result.status, RunStatus::Error);
        assert!(matches!(
            result.events.last(),
            Some(AgentEvent::Error { message }) if message.contains("rate limited")
        ));
        // The partial text was still relayed to the caller.
        assert_eq!(result.text, "partial ");
    }

    #[tokio::test]
    async fn unknown_tool_feeds_failure_back_to_the_model() {
        let client = ScriptedMockClient::tool_then_text("t1", "missing_tool", "{}", "recovered");
        let mut session = echo_session(client, false);

        let result = session.run("try it").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.text, "recovered");
        let tool_result = session
            .state()
            .get_messages()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_result.content.as_deref().unwrap().contains("Unknown tool"));
        assert_history_invariant(session.state());
    }

    // ── Nudge (eval mode) ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn nudge_reprompts_short_answers_without_completion_signal() {
        let client = ScriptedMockClient::new(vec![
            vec![
                StreamEvent::Text {
                    content: "still looking into it".into(),
                },
                StreamEvent::Done {
                    usage: Usage::default(),
                },
            ],
            vec![
                StreamEvent::Text {
                    content: "Task complete.".into(),
                },
                StreamEvent::Done {
                    usage: Usage::default(),
                },
            ],
        ]);
        let mut session = echo_session(client, false);
        session.enable_nudge = true;

        let result = session.run("work").await;

        assert_eq!(result.status, RunStatus::Completed);
        let user_messages = session.state().get_user_messages();
        assert_eq!(user_messages.len(), 2, "original prompt + one nudge");
        assert!(user_messages[1].contains("continue working"));
    }

    #[tokio::test]
    async fn nudges_are_capped_per_run() {
        let scripts: Vec<Vec<StreamEvent>> = (0..6)
            .map(|i| {
                vec![
                    StreamEvent::Text {
                        content: format!("hmm {i}"),
                    },
                    StreamEvent::Done {
                        usage: Usage::default(),
                    },
                ]
            })
            .collect();
        let client = ScriptedMockClient::new(scripts);
        let mut session = echo_session(client, false);
        session.enable_nudge = true;

        let result = session.run("work").await;

        assert_eq!(result.status, RunStatus::Completed);
        // 1 original prompt + at most 3 nudges.
        assert_eq!(session.state().get_user_messages().len(), 4);
    }

    #[tokio::test]
    async fn nudge_disabled_by_default() {
        let client = ScriptedMockClient::always_text("ok");
        let mut session = echo_session(client, false);
        let result = session.run("work").await;
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(session.state().get_user_messages().len(), 1);
    }

    // ── Max turns ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn max_turns_bounds_the_loop() {
        // Model always asks for another tool call; the bound must stop it.
        let scripts: Vec<Vec<StreamEvent>> = (0..10)
            .map(|i| {
                vec![
                    StreamEvent::ToolCall {
                        id: format!("t{i}"),
                        name: "echo".into(),
                        arguments: r#"{"text":"loop"}"#.into(),
                    },
                    StreamEvent::Done {
                        usage: Usage::default(),
                    },
                ]
            })
            .collect();
        let client = ScriptedMockClient::new(scripts);
        let mut session = echo_session(client, false);

        let result = session
            .run_with_options(
                "loop forever",
                crate::RunOptions {
                    max_turns: Some(2),
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(result.status, RunStatus::Completed);
        let tool_results = session
            .state()
            .get_messages()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(tool_results, 2, "exactly max_turns tool rounds");
    }

    // ── Delegate ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delegate_runs_child_and_reports_metadata() {
        let parent_client = ScriptedMockClient::tool_then_text(
            "d1",
            "delegate",
            r#"{"instruction":"summarize the logs"}"#,
            "parent done",
        );
        let agent = test_agent();
        let mut session = Session::with_client(Arc::clone(&agent), Arc::new(parent_client));

        let child_client = Arc::new(ScriptedMockClient::always_text("child says hello"));
        let delegate =
            DelegateTool::new(&agent, Arc::clone(session.hooks())).with_client(child_client);
        let mut registry = ToolRegistry::new();
        registry.register(delegate);
        session.set_registry(Arc::new(registry));

        let result = session.run("use the delegate").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.text, "parent done");
        let tool_end = result
            .events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolEnd {
                    tool_result,
                    tool_metadata,
                    ..
                } => Some((tool_result.clone(), tool_metadata.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_end.0, "child says hello");
        assert_eq!(tool_end.1["child_status"], json!("completed"));
        assert!(tool_end.1.contains_key("child_session_id"));
    }

    #[tokio::test]
    async fn delegate_child_profile_has_no_delegate() {
        let agent = test_agent();
        let session = Session::with_client(
            Arc::clone(&agent),
            Arc::new(ScriptedMockClient::always_text("x")),
        );
        let delegate = DelegateTool::new(&agent, Arc::clone(session.hooks()));
        // The child profile is derived with delegation stripped; a child
        // session built from it can never see a delegate tool.
        let _ = delegate; // construction is the assertion surface here
        assert!(!agent.profile().without_delegate().enable_delegate);
    }

    // ── State bookkeeping ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_count_and_status_track_runs() {
        let client = ScriptedMockClient::new(vec![
            vec![
                StreamEvent::Text {
                    content: "one".into(),
                },
                StreamEvent::Done {
                    usage: Usage::default(),
                },
            ],
            vec![
                StreamEvent::Text {
                    content: "two".into(),
                },
                StreamEvent::Done {
                    usage: Usage::default(),
                },
            ],
        ]);
        let mut session = echo_session(client, false);
        assert_eq!(session.state().run_count, 0);

        session.run("a").await;
        assert_eq!(session.state().run_count, 1);
        assert_eq!(session.state().status, crate::SessionStatus::Completed);

        session.run("b").await;
        assert_eq!(session.state().run_count, 2);
    }

    #[tokio::test]
    async fn turn_complete_reports_cumulative_totals() {
        let client = ScriptedMockClient::tool_then_text("t1", "echo", r#"{"text":"x"}"#, "done");
        let mut session = echo_session(client, false);
        let result = session.run("go").await;

        let totals = result
            .events
            .iter()
            .find_map(|e| match e {
                AgentEvent::TurnComplete { totals } => Some(*totals),
                _ => None,
            })
            .unwrap();
        // Cumulative across both API calls, not the last delta.
        assert_eq!(totals.usage.input_tokens, 25);
        // Context size is the last measured input-token count.
        assert_eq!(totals.context_size, 15);
    }
}
