// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Observability processor: wraps a session's event stream, mirroring every
//! event unchanged downstream while deriving turn, tool-execution, and
//! model-call records for the exporter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use rho_core::AgentEvent;

use crate::context::{TelemetryContext, ToolExecutionContext, TurnContext};
use crate::exporter::Exporter;

pub struct ObservabilityProcessor {
    context: TelemetryContext,
    exporter: Arc<dyn Exporter>,

    current_turn: Option<TurnContext>,
    pending_tools: HashMap<String, ToolExecutionContext>,
    pending_order: VecDeque<String>,

    turn_input_tokens: u64,
    turn_output_tokens: u64,
    turn_reasoning_tokens: u64,

    session_started: bool,
    session_ended: bool,
}

impl ObservabilityProcessor {
    pub fn new(context: TelemetryContext, exporter: Arc<dyn Exporter>) -> Self {
        Self {
            context,
            exporter,
            current_turn: None,
            pending_tools: HashMap::new(),
            pending_order: VecDeque::new(),
            turn_input_tokens: 0,
            turn_output_tokens: 0,
            turn_reasoning_tokens: 0,
            session_started: false,
            session_ended: false,
        }
    }

    pub fn context(&self) -> &TelemetryContext {
        &self.context
    }

    /// Idempotent per processor instance.
    pub async fn start_session(&mut self) {
        if self.session_started || self.session_ended {
            return;
        }
        self.exporter.start_session(&self.context).await;
        self.session_started = true;
    }

    pub async fn end_session(&mut self, status: &str) {
        if !self.session_started || self.session_ended {
            return;
        }
        self.merge_exporter_health();
        self.context.end_session(status);
        self.exporter.end_session(&self.context).await;
        self.session_ended = true;
    }

    /// Wrap one turn's event stream: every event read from `source` is
    /// processed for telemetry, then forwarded to `sink` unchanged.
    /// Terminates on the turn's final event or when the stream closes.
    pub async fn wrap_turn(
        &mut self,
        mut source: mpsc::Receiver<AgentEvent>,
        sink: mpsc::Sender<AgentEvent>,
        user_input: &str,
    ) {
        self.begin_turn(user_input).await;
        while let Some(event) = source.recv().await {
            self.process_event(&event).await;
            let terminal = matches!(
                event,
                AgentEvent::TurnComplete { .. }
                    | AgentEvent::Cancelled { .. }
                    | AgentEvent::Error { .. }
                    | AgentEvent::Interruption { .. }
            );
            let _ = sink.send(event).await;
            if terminal {
                break;
            }
        }
        self.finish_turn().await;
    }

    /// Begin a turn record.  `wrap_turn` calls this; callers driving
    /// `process_event` by hand (collected-event replay) call it directly.
    pub async fn begin_turn(&mut self, user_input: &str) {
        let turn_id = self.context.start_turn();
        let turn = TurnContext::new(
            turn_id,
            &self.context.session_id,
            self.context.turn_index,
            user_input,
        );
        self.turn_input_tokens = 0;
        self.turn_output_tokens = 0;
        self.turn_reasoning_tokens = 0;
        self.pending_tools.clear();
        self.pending_order.clear();
        self.exporter.start_turn(&turn).await;
        self.current_turn = Some(turn);
    }

    /// Close the current turn record and flush totals.
    pub async fn finish_turn(&mut self) {
        if let Some(mut turn) = self.current_turn.take() {
            turn.input_tokens = self.turn_input_tokens;
            turn.output_tokens = self.turn_output_tokens;
            turn.reasoning_tokens = self.turn_reasoning_tokens;
            turn.end();
            self.exporter.end_turn(&turn).await;
        }
        self.merge_exporter_health();
    }

    /// Derive telemetry from one event.  The event itself is never touched.
    pub async fn process_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::ToolStart {
                tool_name,
                tool_call_id,
                tool_args,
            } => {
                let turn_id = self
                    .current_turn
                    .as_ref()
                    .map(|t| t.turn_id.clone())
                    .unwrap_or_default();
                let execution = ToolExecutionContext::new(&turn_id, tool_name, tool_args.clone());
                let key = if tool_call_id.is_empty() {
                    execution.execution_id.clone()
                } else {
                    tool_call_id.clone()
                };
                self.pending_tools.insert(key.clone(), execution);
                self.pending_order.push_back(key);
                self.context.record_tool_call();
                self.exporter
                    .increment_tool_call(&self.context.session_id)
                    .await;
            }

            AgentEvent::ToolEnd {
                tool_call_id,
                tool_result,
                ..
            } => {
                if let Some(mut execution) = self.pop_pending_tool(tool_call_id) {
                    execution.end(true, None);
                    execution.result = Some(tool_result.clone());
                    self.exporter.record_tool_execution(&execution).await;
                }
            }

            AgentEvent::ToolBlocked { tool_call_id, .. } => {
                if let Some(mut execution) = self.pop_pending_tool(tool_call_id) {
                    execution.end(false, Some("Blocked by user"));
                    self.exporter.record_tool_execution(&execution).await;
                }
            }

            AgentEvent::ApiCallComplete { usage, .. } => {
                self.turn_input_tokens += usage.input_tokens;
                self.turn_output_tokens += usage.output_tokens;
                self.turn_reasoning_tokens += usage.reasoning_tokens;
                self.context.record_tokens(
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.reasoning_tokens,
                );
                if let Some(turn) = &self.current_turn {
                    self.exporter
                        .record_model_call(
                            &turn.turn_id,
                            usage.input_tokens,
                            usage.output_tokens,
                            0, // latency is not carried on the event
                        )
                        .await;
                }
            }

            AgentEvent::TurnComplete { totals } => {
                // `totals` carries session-cumulative counts; add only the
                // remainder beyond what per-call events already recorded,
                // so nothing is double counted.
                let remainder_input = totals
                    .usage
                    .input_tokens
                    .saturating_sub(self.context.total_input_tokens);
                let remainder_output = totals
                    .usage
                    .output_tokens
                    .saturating_sub(self.context.total_output_tokens);
                let remainder_reasoning = totals
                    .usage
                    .reasoning_tokens
                    .saturating_sub(self.context.total_reasoning_tokens);
                self.turn_input_tokens += remainder_input;
                self.turn_output_tokens += remainder_output;
                self.turn_reasoning_tokens += remainder_reasoning;
                self.context
                    .record_tokens(remainder_input, remainder_output, remainder_reasoning);

                self.context.context_size = totals.context_size;
                if let Some(turn) = &mut self.current_turn {
                    turn.context_size = totals.context_size;
                }
            }

            AgentEvent::Error { message } => {
                // Any tool still pending did not finish; record it failed.
                let failed = self.drain_pending_tools();
                for mut execution in failed {
                    execution.end(false, Some(message));
                    self.exporter.record_tool_execution(&execution).await;
                }
            }

            AgentEvent::Text { .. }
            | AgentEvent::CompactStart { .. }
            | AgentEvent::CompactEnd { .. }
            | AgentEvent::Interruption { .. }
            | AgentEvent::Cancelled { .. } => {}
        }
    }

    /// Pop a pending tool by call id, falling back to FIFO order when the
    /// id is absent or unknown.
    fn pop_pending_tool(&mut self, tool_call_id: &str) -> Option<ToolExecutionContext> {
        if !tool_call_id.is_empty() {
            if let Some(execution) = self.pending_tools.remove(tool_call_id) {
                self.pending_order.retain(|k| k != tool_call_id);
                return Some(execution);
            }
        }
        while let Some(key) = self.pending_order.pop_front() {
            if let Some(execution) = self.pending_tools.remove(&key) {
                return Some(execution);
            }
        }
        None
    }

    fn drain_pending_tools(&mut self) -> Vec<ToolExecutionContext> {
        let mut drained = Vec::new();
        while let Some(key) = self.pending_order.pop_front() {
            if let Some(execution) = self.pending_tools.remove(&key) {
                drained.push(execution);
            }
        }
        drained.extend(self.pending_tools.drain().map(|(_, v)| v));
        drained
    }

    /// Copy exporter degradation counters into the session metadata so
    /// callers can observe telemetry health without touching the exporter.
    fn merge_exporter_health(&mut self) {
        let health = self.exporter.health();
        if health.degraded {
            self.context
                .metadata
                .insert("telemetry_degraded".into(), json!(true));
            self.context
                .metadata
                .insert("telemetry_write_retries".into(), json!(health.write_retries));
            self.context
                .metadata
                .insert("telemetry_write_errors".into(), json!(health.write_errors));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rho_core::TurnTotals;
    use rho_model::Usage;
    use serde_json::Map;

    use super::*;
    use crate::exporter::{write_with_retry, ExporterHealth, HealthCounters};

    /// Exporter that records operation names for assertion.
    #[derive(Default)]
    struct RecordingExporter {
        ops: Mutex<Vec<String>>,
        tool_records: Mutex<Vec<ToolExecutionContext>>,
    }

    impl RecordingExporter {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Exporter for RecordingExporter {
        async fn start_session(&self, _context: &TelemetryContext) {
            self.ops.lock().unwrap().push("start_session".into());
        }
        async fn end_session(&self, _context: &TelemetryContext) {
            self.ops.lock().unwrap().push("end_session".into());
        }
        async fn start_turn(&self, _turn: &TurnContext) {
            self.ops.lock().unwrap().push("start_turn".into());
        }
        async fn end_turn(&self, _turn: &TurnContext) {
            self.ops.lock().unwrap().push("end_turn".into());
        }
        async fn record_model_call(&self, _turn_id: &str, _i: u64, _o: u64, _l: u64) {
            self.ops.lock().unwrap().push("record_model_call".into());
        }
        async fn record_tool_execution(&self, execution: &ToolExecutionContext) {
            self.ops.lock().unwrap().push("record_tool_execution".into());
            self.tool_records.lock().unwrap().push(execution.clone());
        }
        async fn increment_tool_call(&self, _session_id: &str) {
            self.ops.lock().unwrap().push("increment_tool_call".into());
        }
    }

    fn processor_with(exporter: Arc<dyn Exporter>) -> ObservabilityProcessor {
        ObservabilityProcessor::new(
            TelemetryContext::new("sess-1", "gpt-5-mini", "readonly"),
            exporter,
        )
    }

    fn tool_start(id: &str) -> AgentEvent {
        AgentEvent::ToolStart {
            tool_name: "bash".into(),
            tool_call_id: id.into(),
            tool_args: Map::new(),
        }
    }

    fn tool_end(id: &str) -> AgentEvent {
        AgentEvent::ToolEnd {
            tool_name: "bash".into(),
            tool_call_id: id.into(),
            tool_result: "ok".into(),
            tool_metadata: Map::new(),
        }
    }

    fn api_call(input: u64, output: u64) -> AgentEvent {
        AgentEvent::ApiCallComplete {
            usage: Usage {
                input_tokens: input,
                output_tokens: output,
                ..Usage::default()
            },
            call_index: 1,
        }
    }

    fn turn_complete(input: u64, output: u64, context_size: u64) -> AgentEvent {
        AgentEvent::TurnComplete {
            totals: TurnTotals {
                usage: Usage {
                    input_tokens: input,
                    output_tokens: output,
                    ..Usage::default()
                },
                context_size,
            },
        }
    }

    // ── Mirroring ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn wrap_turn_mirrors_every_event_unchanged() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(exporter);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let events = vec![
            AgentEvent::Text {
                content: "hello".into(),
            },
            tool_start("t1"),
            tool_end("t1"),
            api_call(10, 5),
            turn_complete(10, 5, 10),
        ];
        for event in &events {
            in_tx.send(event.clone()).await.unwrap();
        }
        drop(in_tx);

        processor.wrap_turn(in_rx, out_tx, "user input").await;

        let mut mirrored = Vec::new();
        while let Ok(event) = out_rx.try_recv() {
            mirrored.push(event);
        }
        assert_eq!(mirrored.len(), events.len(), "no event lost or duplicated");
        assert!(matches!(mirrored[0], AgentEvent::Text { ref content } if content == "hello"));
        assert!(matches!(mirrored.last(), Some(AgentEvent::TurnComplete { .. })));
    }

    // ── Tool tracking ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_executions_are_recorded_with_success() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        processor.begin_turn("go").await;
        processor.process_event(&tool_start("t1")).await;
        processor.process_event(&tool_end("t1")).await;
        processor.finish_turn().await;

        let records = exporter.tool_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].result.as_deref(), Some("ok"));
        assert_eq!(records[0].tool_name, "bash");
    }

    #[tokio::test]
    async fn blocked_tool_is_recorded_as_failed() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        processor.begin_turn("go").await;
        processor.process_event(&tool_start("t1")).await;
        processor
            .process_event(&AgentEvent::ToolBlocked {
                tool_name: "bash".into(),
                tool_call_id: "t1".into(),
            })
            .await;
        processor.finish_turn().await;

        let records = exporter.tool_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("Blocked by user"));
    }

    #[tokio::test]
    async fn fifo_fallback_matches_tools_without_ids() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        processor.begin_turn("go").await;
        processor.process_event(&tool_start("")).await;
        processor.process_event(&tool_start("")).await;
        processor.process_event(&tool_end("")).await;
        processor.process_event(&tool_end("")).await;
        processor.finish_turn().await;

        assert_eq!(exporter.tool_records.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn error_drains_pending_tools_as_failures() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        processor.begin_turn("go").await;
        processor.process_event(&tool_start("t1")).await;
        processor.process_event(&tool_start("t2")).await;
        processor
            .process_event(&AgentEvent::Error {
                message: "stream died".into(),
            })
            .await;
        processor.finish_turn().await;

        let records = exporter.tool_records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.success));
        assert!(records
            .iter()
            .all(|r| r.error.as_deref() == Some("stream died")));
    }

    // ── Token reconciliation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn turn_complete_adds_only_the_remainder() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(exporter);
        processor.begin_turn("go").await;
        processor.process_event(&api_call(100, 20)).await;
        processor.process_event(&api_call(50, 10)).await;
        // Cumulative totals match the per-call sum: no remainder to add.
        processor.process_event(&turn_complete(150, 30, 150)).await;
        processor.finish_turn().await;

        assert_eq!(processor.context().total_input_tokens, 150);
        assert_eq!(processor.context().total_output_tokens, 30);
        assert_eq!(processor.context().context_size, 150);
    }

    #[tokio::test]
    async fn uncaptured_usage_in_turn_complete_is_not_lost() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(exporter);
        processor.begin_turn("go").await;
        // Totals exceed the per-call records (e.g. compaction usage).
        processor.process_event(&api_call(100, 20)).await;
        processor.process_event(&turn_complete(180, 25, 180)).await;
        processor.finish_turn().await;

        assert_eq!(processor.context().total_input_tokens, 180);
        assert_eq!(processor.context().total_output_tokens, 25);
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_start_and_end_are_idempotent() {
        let exporter = Arc::new(RecordingExporter::default());
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        processor.start_session().await;
        processor.start_session().await;
        processor.end_session("completed").await;
        processor.end_session("completed").await;

        let ops = exporter.ops();
        assert_eq!(ops.iter().filter(|o| *o == "start_session").count(), 1);
        assert_eq!(ops.iter().filter(|o| *o == "end_session").count(), 1);
    }

    // ── Telemetry resilience ──────────────────────────────────────────────────

    /// Exporter whose `start_turn` fails transiently twice, then succeeds —
    /// the degradation path of a locked database.
    struct FlakyExporter {
        health: HealthCounters,
        attempts: Arc<AtomicUsize>,
        turns_written: Arc<AtomicUsize>,
    }

    impl FlakyExporter {
        fn new() -> Self {
            Self {
                health: HealthCounters::default(),
                attempts: Arc::new(AtomicUsize::new(0)),
                turns_written: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Exporter for FlakyExporter {
        async fn start_session(&self, _context: &TelemetryContext) {}
        async fn end_session(&self, _context: &TelemetryContext) {}
        async fn start_turn(&self, _turn: &TurnContext) {
            let attempts = Arc::clone(&self.attempts);
            let written = Arc::clone(&self.turns_written);
            write_with_retry(
                &self.health,
                "create_turn",
                Arc::new(move || {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("database is locked")
                    }
                    written.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                |_| true,
            )
            .await;
        }
        async fn end_turn(&self, _turn: &TurnContext) {}
        async fn record_model_call(&self, _t: &str, _i: u64, _o: u64, _l: u64) {}
        async fn record_tool_execution(&self, _execution: &ToolExecutionContext) {}
        async fn increment_tool_call(&self, _session_id: &str) {}
        fn health(&self) -> ExporterHealth {
            self.health.snapshot()
        }
    }

    #[tokio::test]
    async fn transient_exporter_failure_degrades_without_perturbing_events() {
        let exporter = Arc::new(FlakyExporter::new());
        let turns_written = Arc::clone(&exporter.turns_written);
        let mut processor = processor_with(Arc::clone(&exporter) as Arc<dyn Exporter>);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let events = vec![
            AgentEvent::Text {
                content: "answer".into(),
            },
            api_call(10, 5),
            turn_complete(10, 5, 10),
        ];
        for event in &events {
            in_tx.send(event.clone()).await.unwrap();
        }
        drop(in_tx);

        processor.wrap_turn(in_rx, out_tx, "question").await;

        // The run's event stream is intact.
        let mut mirrored = Vec::new();
        while let Ok(event) = out_rx.try_recv() {
            mirrored.push(event);
        }
        assert_eq!(mirrored.len(), events.len());

        // The write eventually landed, after retries.
        assert_eq!(turns_written.load(Ordering::SeqCst), 1);

        // Degradation is visible in the session metadata.
        let metadata = &processor.context().metadata;
        assert_eq!(metadata["telemetry_degraded"], json!(true));
        assert!(metadata["telemetry_write_retries"].as_u64().unwrap() >= 1);
    }
}
