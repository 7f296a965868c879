// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session control transports.
//!
//! [`SessionControl`] abstracts the control plane so cross-node deployments
//! have a first-class path: the file transport wraps the sentinel protocol
//! for a single machine; the SQLite transport mirrors the same contract
//! through a shared database with heartbeats, using time-based staleness
//! instead of pid liveness.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rusqlite::Connection;

use crate::signals::{AgentInfo, SignalManager};

/// Cross-process control plane for running sessions.
pub trait SessionControl: Send + Sync {
    fn register(&self, info: &AgentInfo) -> anyhow::Result<()>;
    fn deregister(&self, session_id: &str) -> anyhow::Result<()>;
    /// Keep-alive; a no-op for transports with their own liveness signal.
    fn heartbeat(&self, session_id: &str) -> anyhow::Result<()>;
    fn request_cancel(&self, session_id: &str) -> anyhow::Result<bool>;
    fn is_cancelled(&self, session_id: &str) -> bool;
    fn request_pause(&self, session_id: &str) -> anyhow::Result<bool>;
    fn clear_pause(&self, session_id: &str) -> anyhow::Result<bool>;
    fn is_paused(&self, session_id: &str) -> bool;
    fn queue_directive(&self, session_id: &str, directive: &str) -> anyhow::Result<bool>;
    fn consume_directives(&self, session_id: &str) -> anyhow::Result<Vec<String>>;
    fn list_running(&self) -> Vec<AgentInfo>;
}

// ─── File transport ───────────────────────────────────────────────────────────

/// [`SessionControl`] over the sentinel-file protocol.
pub struct FileSignalTransport {
    manager: SignalManager,
}

impl FileSignalTransport {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            manager: SignalManager::new()?,
        })
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            manager: SignalManager::with_dir(dir)?,
        })
    }

    pub fn manager(&self) -> &SignalManager {
        &self.manager
    }
}

impl SessionControl for FileSignalTransport {
    fn register(&self, info: &AgentInfo) -> anyhow::Result<()> {
        self.manager.register(info)
    }

    fn deregister(&self, session_id: &str) -> anyhow::Result<()> {
        self.manager.deregister(session_id)
    }

    fn heartbeat(&self, _session_id: &str) -> anyhow::Result<()> {
        // Pid liveness is the staleness signal; nothing to refresh.
        Ok(())
    }

    fn request_cancel(&self, session_id: &str) -> anyhow::Result<bool> {
        self.manager.cancel(session_id)
    }

    fn is_cancelled(&self, session_id: &str) -> bool {
        self.manager.is_cancelled(session_id)
    }

    fn request_pause(&self, session_id: &str) -> anyhow::Result<bool> {
        self.manager.pause(session_id)
    }

    fn clear_pause(&self, session_id: &str) -> anyhow::Result<bool> {
        self.manager.resume(session_id)
    }

    fn is_paused(&self, session_id: &str) -> bool {
        self.manager.is_paused(session_id)
    }

    fn queue_directive(&self, session_id: &str, directive: &str) -> anyhow::Result<bool> {
        self.manager.queue_directive(session_id, directive)
    }

    fn consume_directives(&self, session_id: &str) -> anyhow::Result<Vec<String>> {
        self.manager.consume_directives(session_id)
    }

    fn list_running(&self) -> Vec<AgentInfo> {
        self.manager.list_running()
    }
}

// ─── SQLite transport ─────────────────────────────────────────────────────────

/// Database-backed control plane for multi-node deployments.
///
/// Sessions heartbeat into the `agents` table; a session whose heartbeat is
/// older than the staleness window is treated as gone by `list_running`.
pub struct SqliteControlTransport {
    path: PathBuf,
    staleness: Duration,
}

impl SqliteControlTransport {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::with_staleness(path, Duration::from_secs(120))
    }

    pub fn with_staleness(path: impl AsRef<Path>, staleness: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let transport = Self { path, staleness };
        let conn = transport.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                session_id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                model TEXT NOT NULL,
                instruction_preview TEXT NOT NULL,
                started_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                paused INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS directives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                directive TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .context("initializing control schema")?;
        Ok(transport)
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening control db {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL journal mode")?;
        conn.busy_timeout(Duration::from_millis(500))
            .context("setting busy timeout")?;
        Ok(conn)
    }

    fn set_flag(&self, session_id: &str, column: &str, value: bool) -> anyhow::Result<bool> {
        let conn = self.connect()?;
        // Column name is one of two compile-time constants, never input.
        let sql = format!("UPDATE agents SET {column} = ?1 WHERE session_id = ?2");
        let changed = conn
            .execute(&sql, rusqlite::params![value as i64, session_id])
            .context("updating agent flag")?;
        Ok(changed > 0)
    }

    fn get_flag(&self, session_id: &str, column: &str) -> bool {
        let conn = match self.connect() {
            Ok(c) => c,
            Err(_) => return false,
        };
        let sql = format!("SELECT {column} FROM agents WHERE session_id = ?1");
        conn.query_row(&sql, [session_id], |row| row.get::<_, i64>(0))
            .map(|v| v != 0)
            .unwrap_or(false)
    }
}

impl SessionControl for SqliteControlTransport {
    fn register(&self, info: &AgentInfo) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO agents
                (session_id, pid, model, instruction_preview, started_at, heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id) DO UPDATE SET
                pid = excluded.pid,
                model = excluded.model,
                instruction_preview = excluded.instruction_preview,
                heartbeat_at = excluded.heartbeat_at,
                cancelled = 0,
                paused = 0",
            rusqlite::params![
                info.session_id,
                info.pid,
                info.model,
                info.instruction_preview,
                info.started_at,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("registering agent")?;
        Ok(())
    }

    fn deregister(&self, session_id: &str) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM agents WHERE session_id = ?1", [session_id])
            .context("deregistering agent")?;
        conn.execute("DELETE FROM directives WHERE session_id = ?1", [session_id])
            .context("clearing directives")?;
        Ok(())
    }

    fn heartbeat(&self, session_id: &str) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE agents SET heartbeat_at = ?1 WHERE session_id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), session_id],
        )
        .context("updating heartbeat")?;
        Ok(())
    }

    fn request_cancel(&self, session_id: &str) -> anyhow::Result<bool> {
        self.set_flag(session_id, "cancelled", true)
    }

    fn is_cancelled(&self, session_id: &str) -> bool {
        self.get_flag(session_id, "cancelled")
    }

    fn request_pause(&self, session_id: &str) -> anyhow::Result<bool> {
        self.set_flag(session_id, "paused", true)
    }

    fn clear_pause(&self, session_id: &str) -> anyhow::Result<bool> {
        self.set_flag(session_id, "paused", false)
    }

    fn is_paused(&self, session_id: &str) -> bool {
        self.get_flag(session_id, "paused")
    }

    fn queue_directive(&self, session_id: &str, directive: &str) -> anyhow::Result<bool> {
        let conn = self.connect()?;
        let known: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agents WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .context("checking agent registration")?;
        if known == 0 {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO directives (session_id, directive, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, directive, Utc::now().to_rfc3339()],
        )
        .context("queueing directive")?;
        Ok(true)
    }

    fn consume_directives(&self, session_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT id, directive FROM directives WHERE session_id = ?1 ORDER BY id")
            .context("preparing directive query")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("querying directives")?
            .collect::<Result<_, _>>()
            .context("reading directives")?;
        drop(stmt);
        if let Some(max_id) = rows.iter().map(|(id, _)| *id).max() {
            conn.execute(
                "DELETE FROM directives WHERE session_id = ?1 AND id <= ?2",
                rusqlite::params![session_id, max_id],
            )
            .context("clearing consumed directives")?;
        }
        Ok(rows
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| !d.trim().is_empty())
            .collect())
    }

    fn list_running(&self) -> Vec<AgentInfo> {
        let conn = match self.connect() {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.staleness).unwrap_or(chrono::Duration::zero());
        let mut stmt = match conn.prepare(
            "SELECT session_id, pid, model, instruction_preview, started_at
             FROM agents WHERE heartbeat_at >= ?1 ORDER BY started_at DESC",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map([cutoff.to_rfc3339()], |row| {
            Ok(AgentInfo {
                session_id: row.get(0)?,
                pid: row.get::<_, i64>(1)? as u32,
                model: row.get(2)?,
                instruction_preview: row.get(3)?,
                started_at: row.get(4)?,
            })
        });
        match rows {
            Ok(iter) => iter.flatten().collect(),
            Err(_) => Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
