// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Exporter contract and best-effort write machinery.
//!
//! Exporter methods never fail outward: transient backend errors retry a
//! bounded number of times with linear backoff, then the write is dropped
//! and degradation is recorded in the health counters.  Telemetry failure
//! never terminates a run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::context::{TelemetryContext, ToolExecutionContext, TurnContext};

pub const MAX_WRITE_RETRIES: u64 = 3;
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Snapshot of an exporter's degradation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExporterHealth {
    pub degraded: bool,
    pub write_retries: u64,
    pub write_errors: u64,
}

impl ExporterHealth {
    pub fn merge(self, other: ExporterHealth) -> ExporterHealth {
        ExporterHealth {
            degraded: self.degraded || other.degraded,
            write_retries: self.write_retries + other.write_retries,
            write_errors: self.write_errors + other.write_errors,
        }
    }
}

/// Shared health counters for exporters built on [`write_with_retry`].
#[derive(Debug, Default)]
pub struct HealthCounters {
    degraded: AtomicBool,
    retries: AtomicU64,
    errors: AtomicU64,
}

impl HealthCounters {
    pub fn record_retry(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        self.degraded.store(true, Ordering::SeqCst);
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ExporterHealth {
        ExporterHealth {
            degraded: self.degraded.load(Ordering::SeqCst),
            write_retries: self.retries.load(Ordering::SeqCst),
            write_errors: self.errors.load(Ordering::SeqCst),
        }
    }
}

/// Run a storage write as best-effort telemetry.
///
/// `is_transient` decides which errors are worth retrying (database locks,
/// connection drops); everything else is dropped immediately.  The closure
/// runs on the blocking pool so a slow backend never stalls the agent loop.
pub async fn write_with_retry(
    health: &HealthCounters,
    op_name: &str,
    write: Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
    is_transient: fn(&anyhow::Error) -> bool,
) {
    let mut attempts: u64 = 0;
    loop {
        let write_clone = Arc::clone(&write);
        let result = tokio::task::spawn_blocking(move || write_clone()).await;
        match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) if attempts < MAX_WRITE_RETRIES && is_transient(&e) => {
                attempts += 1;
                health.record_retry();
                tokio::time::sleep(BASE_RETRY_DELAY * attempts as u32).await;
            }
            Ok(Err(e)) => {
                health.record_error();
                warn!(op = op_name, error = %e, "telemetry write skipped");
                return;
            }
            Err(e) => {
                health.record_error();
                warn!(op = op_name, error = %e, "telemetry write task failed");
                return;
            }
        }
    }
}

/// A destination for telemetry records.  All methods are best-effort.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn start_session(&self, context: &TelemetryContext);
    async fn end_session(&self, context: &TelemetryContext);
    async fn start_turn(&self, turn: &TurnContext);
    async fn end_turn(&self, turn: &TurnContext);
    async fn record_model_call(
        &self,
        turn_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        latency_ms: u64,
    );
    async fn record_tool_execution(&self, execution: &ToolExecutionContext);
    async fn increment_tool_call(&self, session_id: &str);
    async fn flush(&self) {}
    async fn close(&self) {}
    fn health(&self) -> ExporterHealth {
        ExporterHealth::default()
    }
}

/// Exporter used when telemetry is disabled.
pub struct NoOpExporter;

#[async_trait]
impl Exporter for NoOpExporter {
    async fn start_session(&self, _context: &TelemetryContext) {}
    async fn end_session(&self, _context: &TelemetryContext) {}
    async fn start_turn(&self, _turn: &TurnContext) {}
    async fn end_turn(&self, _turn: &TurnContext) {}
    async fn record_model_call(&self, _turn_id: &str, _input: u64, _output: u64, _latency: u64) {}
    async fn record_tool_execution(&self, _execution: &ToolExecutionContext) {}
    async fn increment_tool_call(&self, _session_id: &str) {}
}

/// Fan-out to multiple exporters.
pub struct CompositeExporter {
    exporters: Vec<Arc<dyn Exporter>>,
}

impl CompositeExporter {
    pub fn new(exporters: Vec<Arc<dyn Exporter>>) -> Self {
        Self { exporters }
    }
}

#[async_trait]
impl Exporter for CompositeExporter {
    async fn start_session(&self, context: &TelemetryContext) {
        for exporter in &self.exporters {
            exporter.start_session(context).await;
        }
    }

    async fn end_session(&self, context: &TelemetryContext) {
        for exporter in &self.exporters {
            exporter.end_session(context).await;
        }
    }

    async fn start_turn(&self, turn: &TurnContext) {
        for exporter in &self.exporters {
            exporter.start_turn(turn).await;
        }
    }

    async fn end_turn(&self, turn: &TurnContext) {
        for exporter in &self.exporters {
            exporter.end_turn(turn).await;
        }
    }

    async fn record_model_call(&self, turn_id: &str, input: u64, output: u64, latency_ms: u64) {
        for exporter in &self.exporters {
            exporter
                .record_model_call(turn_id, input, output, latency_ms)
                .await;
        }
    }

    async fn record_tool_execution(&self, execution: &ToolExecutionContext) {
        for exporter in &self.exporters {
            exporter.record_tool_execution(execution).await;
        }
    }

    async fn increment_tool_call(&self, session_id: &str) {
        for exporter in &self.exporters {
            exporter.increment_tool_call(session_id).await;
        }
    }

    async fn flush(&self) {
        for exporter in &self.exporters {
            exporter.flush().await;
        }
    }

    async fn close(&self) {
        for exporter in &self.exporters {
            exporter.close().await;
        }
    }

    fn health(&self) -> ExporterHealth {
        self.exporters
            .iter()
            .map(|e| e.health())
            .fold(ExporterHealth::default(), ExporterHealth::merge)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
