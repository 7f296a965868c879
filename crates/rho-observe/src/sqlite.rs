// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite exporter: the default telemetry destination, no external service
//! required.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::Connection;

use crate::context::{TelemetryContext, ToolExecutionContext, TurnContext};
use crate::exporter::{write_with_retry, Exporter, ExporterHealth, HealthCounters};

/// Synchronous storage layer over the telemetry database.
pub struct TelemetryStorage {
    path: PathBuf,
}

impl TelemetryStorage {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let storage = Self { path };
        let conn = storage.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                profile TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL,
                total_input_tokens INTEGER NOT NULL DEFAULT 0,
                total_output_tokens INTEGER NOT NULL DEFAULT 0,
                tool_calls INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS turns (
                turn_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                turn_index INTEGER NOT NULL,
                user_input TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                reasoning_tokens INTEGER NOT NULL DEFAULT 0,
                context_size INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS tool_executions (
                execution_id TEXT PRIMARY KEY,
                turn_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );",
        )
        .context("initializing telemetry schema")?;
        Ok(storage)
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening telemetry db {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL journal mode")?;
        Ok(conn)
    }

    pub fn create_session(&self, context: &TelemetryContext) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions
                (session_id, model, profile, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                context.session_id,
                context.model,
                context.profile,
                context.started_at.to_rfc3339(),
                context.status,
            ],
        )
        .context("creating session row")?;
        Ok(())
    }

    pub fn update_session(&self, context: &TelemetryContext) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sessions SET
                ended_at = ?1,
                status = ?2,
                total_input_tokens = ?3,
                total_output_tokens = ?4,
                tool_calls = ?5
             WHERE session_id = ?6",
            rusqlite::params![
                context.ended_at.map(|t| t.to_rfc3339()),
                context.status,
                context.total_input_tokens as i64,
                context.total_output_tokens as i64,
                context.tool_calls as i64,
                context.session_id,
            ],
        )
        .context("updating session row")?;
        Ok(())
    }

    pub fn create_turn(&self, turn: &TurnContext) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO turns
                (turn_id, session_id, turn_index, user_input, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                turn.turn_id,
                turn.session_id,
                turn.turn_index as i64,
                turn.user_input,
                turn.started_at.to_rfc3339(),
            ],
        )
        .context("creating turn row")?;
        Ok(())
    }

    pub fn end_turn(&self, turn: &TurnContext) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE turns SET
                ended_at = ?1,
                input_tokens = ?2,
                output_tokens = ?3,
                reasoning_tokens = ?4,
                context_size = ?5
             WHERE turn_id = ?6",
            rusqlite::params![
                turn.ended_at.map(|t| t.to_rfc3339()),
                turn.input_tokens as i64,
                turn.output_tokens as i64,
                turn.reasoning_tokens as i64,
                turn.context_size as i64,
                turn.turn_id,
            ],
        )
        .context("updating turn row")?;
        Ok(())
    }

    pub fn record_tool_execution(&self, execution: &ToolExecutionContext) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO tool_executions
                (execution_id, turn_id, tool_name, started_at, ended_at,
                 duration_ms, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                execution.execution_id,
                execution.turn_id,
                execution.tool_name,
                execution.started_at.to_rfc3339(),
                execution.ended_at.map(|t| t.to_rfc3339()),
                execution.duration_ms(),
                execution.success as i64,
                execution.error,
            ],
        )
        .context("recording tool execution")?;
        Ok(())
    }

    pub fn increment_session_tool_calls(&self, session_id: &str) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sessions SET tool_calls = tool_calls + 1 WHERE session_id = ?1",
            [session_id],
        )
        .context("incrementing tool calls")?;
        Ok(())
    }
}

/// Retry on lock contention only; anything else is dropped immediately.
fn is_lock_error(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

/// Exporter persisting telemetry to SQLite with bounded retries.
pub struct SqliteExporter {
    storage: Arc<TelemetryStorage>,
    health: HealthCounters,
}

impl SqliteExporter {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self {
            storage: Arc::new(TelemetryStorage::new(path)?),
            health: HealthCounters::default(),
        })
    }

    pub fn storage(&self) -> &Arc<TelemetryStorage> {
        &self.storage
    }
}

#[async_trait]
impl Exporter for SqliteExporter {
    async fn start_session(&self, context: &TelemetryContext) {
        let storage = Arc::clone(&self.storage);
        let context = context.clone();
        write_with_retry(
            &self.health,
            "create_session",
            Arc::new(move || storage.create_session(&context)),
            is_lock_error,
        )
        .await;
    }

    async fn end_session(&self, context: &TelemetryContext) {
        let storage = Arc::clone(&self.storage);
        let context = context.clone();
        write_with_retry(
            &self.health,
            "update_session",
            Arc::new(move || storage.update_session(&context)),
            is_lock_error,
        )
        .await;
    }

    async fn start_turn(&self, turn: &TurnContext) {
        let storage = Arc::clone(&self.storage);
        let turn = turn.clone();
        write_with_retry(
            &self.health,
            "create_turn",
            Arc::new(move || storage.create_turn(&turn)),
            is_lock_error,
        )
        .await;
    }

    async fn end_turn(&self, turn: &TurnContext) {
        let storage = Arc::clone(&self.storage);
        let turn = turn.clone();
        write_with_retry(
            &self.health,
            "end_turn",
            Arc::new(move || storage.end_turn(&turn)),
            is_lock_error,
        )
        .await;
    }

    async fn record_model_call(
        &self,
        _turn_id: &str,
        _input_tokens: u64,
        _output_tokens: u64,
        _latency_ms: u64,
    ) {
        // Model calls aggregate into the turn row; there is no separate
        // per-call table in the SQLite schema.
    }

    async fn record_tool_execution(&self, execution: &ToolExecutionContext) {
        let storage = Arc::clone(&self.storage);
        let execution = execution.clone();
        write_with_retry(
            &self.health,
            "record_tool_execution",
            Arc::new(move || storage.record_tool_execution(&execution)),
            is_lock_error,
        )
        .await;
    }

    async fn increment_tool_call(&self, session_id: &str) {
        let storage = Arc::clone(&self.storage);
        let session_id = session_id.to_string();
        write_with_retry(
            &self.health,
            "increment_session_tool_calls",
            Arc::new(move || storage.increment_session_tool_calls(&session_id)),
            is_lock_error,
        )
        .await;
    }

    fn health(&self) -> ExporterHealth {
        self.health.snapshot()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
