// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session — execution context binding one Agent to one State.
//!
//! One session = one conversation thread.  Creating a session freezes the
//! agent's tool registry; the session then drives the agentic loop: model
//! call → tool dispatch → repeat, until the model answers in plain text.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use futures::StreamExt;
use rho_model::{Message, ModelClient, Prompt, StreamEvent, ToolCallSpec};
use rho_tools::{truncate_output, ToolInvocation, ToolRegistry, TruncateOptions};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::agent::Agent;
use crate::compact::{
    format_history_for_summary, CompactResult, AUTO_COMPACT_THRESHOLD,
    COMPACTION_SYSTEM_PROMPT, SUMMARY_PREFIX,
};
use crate::delegate::DelegateTool;
use crate::events::{AgentEvent, CompactTrigger, RunStatus, TurnTotals};
use crate::runstate::{RunState, ToolApprovalItem};
use crate::state::{SessionStatus, State};

// Continuation nudge settings (eval mode only).
const MAX_NUDGES: u32 = 3;
const NUDGE_MESSAGE: &str = "Please continue working on the task. If you need a tool that's \
     missing, install it. If an approach failed, try a different method.";
const COMPLETION_SIGNALS: &[&str] = &[
    "task complete",
    "successfully completed",
    "finished",
    "done",
    "completed the task",
    "solution is ready",
    "have completed",
    "is complete",
];

pub(crate) const REJECTED_RESULT: &str =
    "Command rejected by user. Awaiting new instructions.";
pub(crate) const SKIPPED_RESULT: &str =
    "Command skipped - user rejected previous command.";

/// Outcome of the approval gate for one tool call.
///
/// `Interrupt` escalates the decision out-of-band: the run pauses, the
/// remaining calls are frozen into a [`RunState`], and the caller resumes
/// later with explicit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Interrupt,
}

/// User-supplied gate for dangerous tool calls.
pub type ApprovalCallback = Arc<
    dyn Fn(String, Map<String, Value>) -> BoxFuture<'static, anyhow::Result<ApprovalDecision>>
        + Send
        + Sync,
>;

pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;
pub type PauseCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Runtime hooks shared between a session and its runtime-aware tools.
///
/// The delegate tool is constructed when the session freezes its registry,
/// before the caller wires an approval callback — so both ends hold this
/// shared cell rather than a value.
pub struct SessionHooks {
    cancelled: AtomicBool,
    cancel_check: Mutex<Option<CancelCheck>>,
    approval: Mutex<Option<ApprovalCallback>>,
    history: Mutex<Vec<Message>>,
}

impl SessionHooks {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            cancel_check: Mutex::new(None),
            approval: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Unified cancellation predicate: in-process flag OR the external
    /// check.  Latches — once true it stays true until the next run resets.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let check = self.cancel_check.lock().expect("hooks lock poisoned").clone();
        if let Some(check) = check {
            if check() {
                self.cancelled.store(true, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn approval_callback(&self) -> Option<ApprovalCallback> {
        self.approval.lock().expect("hooks lock poisoned").clone()
    }

    /// Snapshot of the parent conversation, refreshed before each tool
    /// execution phase.  Read by the delegate tool for full-context spawns.
    pub fn history_snapshot(&self) -> Vec<Message> {
        self.history.lock().expect("hooks lock poisoned").clone()
    }

    fn set_history(&self, messages: Vec<Message>) {
        *self.history.lock().expect("hooks lock poisoned") = messages;
    }
}

/// Options for one `run` call.
#[derive(Default, Clone)]
pub struct RunOptions {
    /// Maximum internal model round-trips; `None` = unlimited.
    pub max_turns: Option<u32>,
    /// Live event mirror.  Every event is also collected into the result.
    pub events_tx: Option<tokio::sync::mpsc::Sender<AgentEvent>>,
}

/// Final product of one `run` call.
#[derive(Debug)]
pub struct RunResult {
    /// Concatenated model text from this run.
    pub text: String,
    pub events: Vec<AgentEvent>,
    pub status: RunStatus,
    /// Cumulative session totals plus last measured context size.
    pub usage: TurnTotals,
    /// Pending approvals when `status == Interrupted`.
    pub interruptions: Vec<ToolApprovalItem>,
    /// Snapshot to pass to `resume` when `status == Interrupted`.
    pub state: Option<RunState>,
}

/// A decoded tool call queued for execution.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    args: Map<String, Value>,
}

impl From<ToolApprovalItem> for PendingCall {
    fn from(item: ToolApprovalItem) -> Self {
        Self {
            id: item.tool_call_id,
            name: item.tool_name,
            args: item.tool_args,
        }
    }
}

/// Event fan-out: collects every event for the result and mirrors it to an
/// optional live channel (a dropped receiver is ignored).
struct Emitter {
    events: Vec<AgentEvent>,
    tx: Option<tokio::sync::mpsc::Sender<AgentEvent>>,
}

impl Emitter {
    fn new(tx: Option<tokio::sync::mpsc::Sender<AgentEvent>>) -> Self {
        Self {
            events: Vec::new(),
            tx,
        }
    }

    async fn emit(&mut self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event.clone()).await;
        }
        self.events.push(event);
    }
}

struct Outcome {
    status: RunStatus,
    interruptions: Vec<ToolApprovalItem>,
    snapshot: Option<RunState>,
}

impl Outcome {
    fn of(status: RunStatus) -> Self {
        Self {
            status,
            interruptions: Vec::new(),
            snapshot: None,
        }
    }
}

pub struct Session {
    agent: Arc<Agent>,
    id: String,
    state: State,
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    hooks: Arc<SessionHooks>,
    /// Compact automatically when the context passes the threshold.
    pub auto_compact: bool,
    /// Context window used for the auto-compaction trigger.
    pub context_window: Option<u64>,
    /// Inject continuation nudges when the model stops short (eval mode).
    pub enable_nudge: bool,
    pause_check: Option<PauseCheck>,
    last_input_tokens: u64,
    call_index: u32,
    nudge_count: u32,
}

impl Session {
    pub fn new(agent: Arc<Agent>) -> Self {
        let client = agent.create_client();
        Self::with_client_and_state(agent, client, State::new())
    }

    pub fn with_state(agent: Arc<Agent>, state: State) -> Self {
        let client = agent.create_client();
        Self::with_client_and_state(agent, client, state)
    }

    pub fn with_client(agent: Arc<Agent>, client: Arc<dyn ModelClient>) -> Self {
        Self::with_client_and_state(agent, client, State::new())
    }

    pub fn with_client_and_state(
        agent: Arc<Agent>,
        client: Arc<dyn ModelClient>,
        state: State,
    ) -> Self {
        let hooks = Arc::new(SessionHooks::new());
        let profile = agent.profile();

        // Freeze the registry.  The delegate tool is runtime-aware — it
        // needs this session's hooks — so it is injected here, not by the
        // tool factory.
        let mut registry = (*agent.registry()).clone();
        if profile.enable_delegate && !registry.contains("delegate") {
            registry.register(DelegateTool::new(&agent, Arc::clone(&hooks)));
        }

        let context_window = agent.context_window();
        Self {
            agent,
            id: Uuid::new_v4().to_string(),
            state,
            client,
            registry: Arc::new(registry),
            hooks,
            auto_compact: true,
            context_window,
            enable_nudge: false,
            pause_check: None,
            last_input_tokens: 0,
            call_index: 0,
            nudge_count: 0,
        }
    }

    // ── Accessors and wiring ──────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Swap the frozen tool surface for subsequent model calls.
    ///
    /// Only the session's own control surface (REPL commands toggling
    /// write access, test harnesses composing custom tools) calls this —
    /// never a concurrent turn.
    pub fn set_registry(&mut self, registry: Arc<ToolRegistry>) {
        self.registry = registry;
    }

    pub fn hooks(&self) -> &Arc<SessionHooks> {
        &self.hooks
    }

    pub fn last_input_tokens(&self) -> u64 {
        self.last_input_tokens
    }

    pub fn set_approval_callback(&self, callback: Option<ApprovalCallback>) {
        *self.hooks.approval.lock().expect("hooks lock poisoned") = callback;
    }

    pub fn set_cancel_check(&self, check: Option<CancelCheck>) {
        *self.hooks.cancel_check.lock().expect("hooks lock poisoned") = check;
    }

    pub fn set_pause_check(&mut self, check: Option<PauseCheck>) {
        self.pause_check = check;
    }

    /// Request cooperative cancellation of the current run.
    pub fn request_cancel(&self) {
        self.hooks.request_cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.hooks.is_cancelled()
    }

    // ── Main execution ────────────────────────────────────────────────────────

    pub async fn run(&mut self, prompt: &str) -> RunResult {
        self.run_with_options(prompt, RunOptions::default()).await
    }

    pub async fn run_with_options(&mut self, prompt: &str, options: RunOptions) -> RunResult {
        self.execute(
            Some(prompt.to_string()),
            Vec::new(),
            HashMap::new(),
            options,
        )
        .await
    }

    /// Resume an interrupted run: restore the snapshot, skip the model
    /// stream, and execute the frozen tool calls.  `approval_decisions`
    /// short-circuit the approval callback and apply FIFO.
    pub async fn resume(
        &mut self,
        snapshot: RunState,
        approval_decisions: HashMap<String, bool>,
    ) -> RunResult {
        self.resume_with_options(snapshot, approval_decisions, RunOptions::default())
            .await
    }

    pub async fn resume_with_options(
        &mut self,
        snapshot: RunState,
        approval_decisions: HashMap<String, bool>,
        options: RunOptions,
    ) -> RunResult {
        self.restore(&snapshot);
        self.execute(None, snapshot.pending_approvals, approval_decisions, options)
            .await
    }

    fn restore(&mut self, snapshot: &RunState) {
        self.id = snapshot.session_id.clone();
        self.state.messages = snapshot.history.clone();
        self.state.usage = snapshot.usage;
        self.last_input_tokens = snapshot.last_input_tokens;
    }

    async fn execute(
        &mut self,
        user_input: Option<String>,
        pending: Vec<ToolApprovalItem>,
        overrides: HashMap<String, bool>,
        options: RunOptions,
    ) -> RunResult {
        self.state.run_count += 1;
        self.state.status = SessionStatus::Running;
        let preview = user_input.as_deref().unwrap_or("[resumed]");
        self.state.emit(json!({"event": "run_start", "prompt": preview}));

        let mut emitter = Emitter::new(options.events_tx.clone());
        let outcome = self
            .run_loop(user_input, pending, overrides, &options, &mut emitter)
            .await;

        self.state.status = match outcome.status {
            RunStatus::Completed => SessionStatus::Completed,
            RunStatus::Cancelled => SessionStatus::Cancelled,
            RunStatus::Error => SessionStatus::Error,
            RunStatus::Interrupted => SessionStatus::Interrupted,
        };
        self.state
            .emit(json!({"event": "run_end", "status": outcome.status.as_str()}));

        let text: String = emitter
            .events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        let usage = emitter
            .events
            .iter()
            .rev()
            .find_map(|e| match e {
                AgentEvent::TurnComplete { totals } => Some(*totals),
                _ => None,
            })
            .unwrap_or(TurnTotals {
                usage: self.state.usage,
                context_size: self.last_input_tokens,
            });

        RunResult {
            text,
            events: emitter.events,
            status: outcome.status,
            usage,
            interruptions: outcome.interruptions,
            state: outcome.snapshot,
        }
    }

    async fn run_loop(
        &mut self,
        user_input: Option<String>,
        pending: Vec<ToolApprovalItem>,
        overrides: HashMap<String, bool>,
        options: &RunOptions,
        emitter: &mut Emitter,
    ) -> Outcome {
        self.hooks.reset_cancel();
        self.nudge_count = 0;
        self.call_index = 0;

        self.wait_while_paused().await;

        // Auto-compact before accepting new input: long histories from a
        // previous run can already be over the threshold.
        if self.should_auto_compact() {
            if let Err(e) = self.compact_with_events(CompactTrigger::Auto, emitter).await {
                emitter
                    .emit(AgentEvent::Error {
                        message: format!("{e:#}"),
                    })
                    .await;
                return Outcome::of(RunStatus::Error);
            }
        }

        if let Some(input) = &user_input {
            if !input.is_empty() {
                self.state.add_user_message(input.clone());
            }
        }

        // Resumed runs enter tool execution directly with the frozen calls.
        let mut queued: Vec<PendingCall> = pending.into_iter().map(PendingCall::from).collect();
        let mut turn: u32 = 0;

        loop {
            if let Some(max) = options.max_turns {
                if turn >= max {
                    return Outcome::of(RunStatus::Completed);
                }
            }
            turn += 1;

            let mut pending_exec = std::mem::take(&mut queued);
            let mut text_content = String::new();

            if pending_exec.is_empty() {
                if self.is_cancelled() {
                    emitter
                        .emit(AgentEvent::Cancelled {
                            reason: "Cancelled before model call".into(),
                        })
                        .await;
                    return Outcome::of(RunStatus::Cancelled);
                }
                self.wait_while_paused().await;

                // Mid-run trigger point: large tool results can push the
                // context over the threshold between model calls.
                if self.should_auto_compact() {
                    if let Err(e) =
                        self.compact_with_events(CompactTrigger::Auto, emitter).await
                    {
                        emitter
                            .emit(AgentEvent::Error {
                                message: format!("{e:#}"),
                            })
                            .await;
                        return Outcome::of(RunStatus::Error);
                    }
                }

                match self
                    .stream_model_turn(emitter, &mut text_content, &mut pending_exec)
                    .await
                {
                    StreamOutcome::Continue => {}
                    StreamOutcome::Cancelled => return Outcome::of(RunStatus::Cancelled),
                    StreamOutcome::Errored => return Outcome::of(RunStatus::Error),
                }

                if pending_exec.is_empty() {
                    if self.enable_nudge && self.nudge_count < MAX_NUDGES {
                        let lower = text_content.to_lowercase();
                        let has_signal = COMPLETION_SIGNALS.iter().any(|s| lower.contains(s));
                        if !has_signal && text_content.len() < 500 {
                            self.nudge_count += 1;
                            self.state.add_user_message(NUDGE_MESSAGE);
                            continue;
                        }
                    }
                    self.nudge_count = 0;
                    let totals = self.turn_totals();
                    emitter.emit(AgentEvent::TurnComplete { totals }).await;
                    return Outcome::of(RunStatus::Completed);
                }
            }

            if self.is_cancelled() {
                emitter
                    .emit(AgentEvent::Cancelled {
                        reason: "Cancelled before tool execution".into(),
                    })
                    .await;
                return Outcome::of(RunStatus::Cancelled);
            }

            match self
                .execute_tools(pending_exec, &overrides, emitter)
                .await
            {
                ToolPhase::Continue => {}
                ToolPhase::Rejected => {
                    let totals = self.turn_totals();
                    emitter.emit(AgentEvent::TurnComplete { totals }).await;
                    return Outcome::of(RunStatus::Completed);
                }
                ToolPhase::Cancelled => return Outcome::of(RunStatus::Cancelled),
                ToolPhase::Errored => return Outcome::of(RunStatus::Error),
                ToolPhase::Interrupted(outcome) => return outcome,
            }
            // Loop back: the next prompt includes the tool results.
        }
    }

    /// Stream one model call, relaying events and collecting tool calls.
    async fn stream_model_turn(
        &mut self,
        emitter: &mut Emitter,
        text_content: &mut String,
        pending_exec: &mut Vec<PendingCall>,
    ) -> StreamOutcome {
        let tools: Vec<rho_model::ToolSpec> = self
            .registry
            .get_specs()
            .into_iter()
            .map(|s| rho_model::ToolSpec::function(s.name, s.description, s.parameters))
            .collect();
        let prompt = Prompt {
            system: self.agent.system_prompt().to_string(),
            messages: self.state.messages.clone(),
            tools,
        };

        self.state.emit(json!({
            "event": "llm_start",
            "model": self.agent.model(),
            "context_size": self.state.estimate_tokens(self.agent.system_prompt()),
        }));

        let mut tool_call_specs: Vec<ToolCallSpec> = Vec::new();
        let mut stream = self.client.stream(prompt).await;
        let mut errored = false;

        while let Some(event) = stream.next().await {
            if self.is_cancelled() {
                emitter
                    .emit(AgentEvent::Cancelled {
                        reason: "Cancelled during model response".into(),
                    })
                    .await;
                return StreamOutcome::Cancelled;
            }
            match event {
                StreamEvent::Text { content } => {
                    text_content.push_str(&content);
                    emitter.emit(AgentEvent::Text { content }).await;
                }
                StreamEvent::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    // Decode lazily; malformed argument JSON becomes an
                    // empty object and the tool reports the miss itself.
                    let args: Map<String, Value> =
                        serde_json::from_str(&arguments).unwrap_or_default();
                    emitter
                        .emit(AgentEvent::ToolStart {
                            tool_name: name.clone(),
                            tool_call_id: id.clone(),
                            tool_args: args.clone(),
                        })
                        .await;
                    tool_call_specs.push(ToolCallSpec::new(id.clone(), name.clone(), arguments));
                    pending_exec.push(PendingCall { id, name, args });
                }
                StreamEvent::Done { usage } => {
                    self.state.update_usage(&usage);
                    self.last_input_tokens = usage.input_tokens;
                    self.call_index += 1;
                    self.state.emit(json!({
                        "event": "llm_end",
                        "model": self.agent.model(),
                        "input_tokens": usage.input_tokens,
                        "output_tokens": usage.output_tokens,
                        "cached_tokens": usage.cached_tokens,
                        "reasoning_tokens": usage.reasoning_tokens,
                        "cost_usd": usage.cost_usd,
                    }));
                    emitter
                        .emit(AgentEvent::ApiCallComplete {
                            usage,
                            call_index: self.call_index,
                        })
                        .await;
                }
                StreamEvent::Error { message } => {
                    emitter.emit(AgentEvent::Error { message }).await;
                    errored = true;
                    break;
                }
            }
        }

        if errored {
            return StreamOutcome::Errored;
        }

        // Tool calls take precedence: when the model emits both, history
        // records the tool-calls message and the text lives in events only.
        if !tool_call_specs.is_empty() {
            self.state.add_assistant_tool_calls(tool_call_specs);
        } else if !text_content.is_empty() {
            self.state.add_assistant_message(text_content.clone());
        }
        StreamOutcome::Continue
    }

    /// Execute queued tool calls FIFO with approval gating.
    async fn execute_tools(
        &mut self,
        pending_exec: Vec<PendingCall>,
        overrides: &HashMap<String, bool>,
        emitter: &mut Emitter,
    ) -> ToolPhase {
        // Refresh the shared history snapshot for runtime-aware tools.
        self.hooks.set_history(self.state.messages.clone());

        for (i, call) in pending_exec.iter().enumerate() {
            if self.is_cancelled() {
                emitter
                    .emit(AgentEvent::Cancelled {
                        reason: "Cancelled before tool execution".into(),
                    })
                    .await;
                return ToolPhase::Cancelled;
            }

            let mut checked = false;
            let mut decision = ApprovalDecision::Approve;
            if let Some(&forced) = overrides.get(&call.id) {
                checked = true;
                decision = if forced {
                    ApprovalDecision::Approve
                } else {
                    ApprovalDecision::Reject
                };
            } else if self.registry.requires_approval(&call.name) {
                if let Some(callback) = self.hooks.approval_callback() {
                    checked = true;
                    match callback(call.name.clone(), call.args.clone()).await {
                        Ok(d) => decision = d,
                        Err(e) => {
                            emitter
                                .emit(AgentEvent::Error {
                                    message: format!("approval callback failed: {e:#}"),
                                })
                                .await;
                            return ToolPhase::Errored;
                        }
                    }
                }
            }

            if checked && decision == ApprovalDecision::Interrupt {
                // Freeze this call and everything after it.  Results for
                // already-executed calls are in history, so the invariant
                // holds; the frozen calls travel in the snapshot instead.
                let interruptions: Vec<ToolApprovalItem> = pending_exec[i..]
                    .iter()
                    .map(|c| ToolApprovalItem {
                        tool_call_id: c.id.clone(),
                        tool_name: c.name.clone(),
                        tool_args: c.args.clone(),
                    })
                    .collect();
                emitter
                    .emit(AgentEvent::Interruption {
                        tool_name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                    })
                    .await;
                let snapshot = self.capture_run_state(interruptions.clone());
                return ToolPhase::Interrupted(Outcome {
                    status: RunStatus::Interrupted,
                    interruptions,
                    snapshot: Some(snapshot),
                });
            }

            if checked && decision == ApprovalDecision::Reject {
                self.state.add_tool_result(call.id.clone(), REJECTED_RESULT);
                self.state.emit(json!({
                    "event": "tool_blocked",
                    "tool_call_id": call.id,
                    "tool_name": call.name,
                    "tool_args": Value::Object(call.args.clone()),
                }));
                emitter
                    .emit(AgentEvent::ToolBlocked {
                        tool_name: call.name.clone(),
                        tool_call_id: call.id.clone(),
                    })
                    .await;
                // The API still needs a result per remaining call id.
                for remaining in &pending_exec[i + 1..] {
                    self.state
                        .add_tool_result(remaining.id.clone(), SKIPPED_RESULT);
                }
                return ToolPhase::Rejected;
            }

            self.state.emit(json!({
                "event": "tool_start",
                "tool_call_id": call.id,
                "tool_name": call.name,
                "tool_args": Value::Object(call.args.clone()),
            }));

            let invocation =
                ToolInvocation::new(call.id.clone(), call.name.clone(), call.args.clone());
            let output = match self.registry.dispatch(&invocation).await {
                Ok(output) => output,
                Err(_) => {
                    // Only Cancelled propagates out of dispatch.
                    emitter
                        .emit(AgentEvent::Cancelled {
                            reason: "Cancelled during tool execution".into(),
                        })
                        .await;
                    return ToolPhase::Cancelled;
                }
            };

            let truncated =
                truncate_output(&output.content, &TruncateOptions::for_tool(&call.name));
            self.state.add_tool_result(call.id.clone(), truncated.clone());
            self.state.emit(json!({
                "event": "tool_end",
                "tool_call_id": call.id,
                "tool_name": call.name,
                "success": output.success,
            }));

            let mut metadata = output.metadata;
            if let Some(lines) = std::env::var("RHO_AGENT_PREVIEW_LINES")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                metadata.insert("preview_lines".into(), json!(lines));
            }
            emitter
                .emit(AgentEvent::ToolEnd {
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    tool_result: truncated,
                    tool_metadata: metadata,
                })
                .await;
        }
        ToolPhase::Continue
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn should_auto_compact(&self) -> bool {
        if !self.auto_compact {
            return false;
        }
        let window = match self.context_window {
            Some(w) => w,
            None => return false,
        };
        // Prefer the measured prompt-token count over the estimate.
        let tokens = if self.last_input_tokens > 0 {
            self.last_input_tokens
        } else {
            self.state.estimate_tokens(self.agent.system_prompt())
        };
        tokens as f64 >= window as f64 * AUTO_COMPACT_THRESHOLD
    }

    async fn compact_with_events(
        &mut self,
        trigger: CompactTrigger,
        emitter: &mut Emitter,
    ) -> anyhow::Result<()> {
        emitter.emit(AgentEvent::CompactStart { trigger }).await;
        let result = self.compact("", trigger).await?;
        emitter
            .emit(AgentEvent::CompactEnd {
                message: format!(
                    "Compacted: {} -> {} tokens",
                    result.tokens_before, result.tokens_after
                ),
            })
            .await;
        Ok(())
    }

    /// Compact the conversation history into a model-produced summary.
    ///
    /// On failure the history is left intact — the error propagates and the
    /// caller decides (the auto path turns it into an error run).
    pub async fn compact(
        &mut self,
        custom_instructions: &str,
        trigger: CompactTrigger,
    ) -> anyhow::Result<CompactResult> {
        let system_prompt = self.agent.system_prompt().to_string();
        let tokens_before = self.state.estimate_tokens(&system_prompt);

        let mut system = COMPACTION_SYSTEM_PROMPT.to_string();
        if !custom_instructions.is_empty() {
            system.push_str(&format!("\n\nUser guidance: {custom_instructions}"));
        }
        let conversation = format_history_for_summary(self.state.get_messages());
        let messages = vec![
            Message::system(system),
            Message::user(format!(
                "Here is the conversation to summarize:\n\n{conversation}"
            )),
        ];

        let (summary, usage) = self
            .client
            .complete(messages)
            .await
            .context("compaction completion failed")?;
        self.state.update_usage(&usage);

        let formatted = format!("{SUMMARY_PREFIX}{summary}");
        let user_messages = self.state.get_user_messages();
        let recent = if user_messages.len() > 3 {
            user_messages[user_messages.len() - 3..].to_vec()
        } else {
            Vec::new()
        };
        self.state.replace_with_summary(formatted, recent);

        let tokens_after = self.state.estimate_tokens(&system_prompt);
        self.state.emit(json!({
            "event": "compact",
            "tokens_before": tokens_before,
            "tokens_after": tokens_after,
            "trigger": trigger.as_str(),
        }));
        debug!(tokens_before, tokens_after, trigger = trigger.as_str(), "compacted session");

        Ok(CompactResult {
            summary,
            tokens_before,
            tokens_after,
            trigger,
        })
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn turn_totals(&self) -> TurnTotals {
        TurnTotals {
            usage: self.state.usage,
            context_size: self.last_input_tokens,
        }
    }

    fn capture_run_state(&self, pending: Vec<ToolApprovalItem>) -> RunState {
        RunState {
            session_id: self.id.clone(),
            system_prompt: self.agent.system_prompt().to_string(),
            history: self.state.messages.clone(),
            usage: self.state.usage,
            last_input_tokens: self.last_input_tokens,
            pending_approvals: pending,
        }
    }

    /// Block at a turn boundary while the pause predicate holds,
    /// re-checking cancellation every poll interval.
    async fn wait_while_paused(&self) {
        let check = match &self.pause_check {
            Some(c) => Arc::clone(c),
            None => return,
        };
        while check() && !self.hooks.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

enum StreamOutcome {
    Continue,
    Cancelled,
    Errored,
}

enum ToolPhase {
    Continue,
    Rejected,
    Cancelled,
    Errored,
    Interrupted(Outcome),
}
