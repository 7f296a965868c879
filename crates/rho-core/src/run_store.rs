// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent storage for interrupted run state.
//!
//! Lets the interrupt/resume round trip cross process boundaries: the run
//! that hit an approval interrupt saves its snapshot, a web UI collects the
//! decisions, and a later process loads the snapshot and resumes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::Connection;

use crate::runstate::RunState;

/// Storage contract for serialized run snapshots.
pub trait RunStore: Send + Sync {
    fn save(&self, run_id: &str, state: &RunState) -> anyhow::Result<()>;
    fn load(&self, run_id: &str) -> anyhow::Result<Option<RunState>>;
    fn delete(&self, run_id: &str) -> anyhow::Result<()>;
}

/// SQLite-backed [`RunStore`]: one row per run id, WAL journal for
/// crash-safety.
pub struct SqliteRunStore {
    path: PathBuf,
}

impl SqliteRunStore {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Self { path };
        let conn = store.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_states (
                run_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .context("initializing run_states schema")?;
        Ok(store)
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening run store {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL journal mode")?;
        Ok(conn)
    }
}

impl RunStore for SqliteRunStore {
    fn save(&self, run_id: &str, state: &RunState) -> anyhow::Result<()> {
        let payload = serde_json::to_string(state).context("serializing run state")?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO run_states (run_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id)
             DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
            rusqlite::params![run_id, payload, chrono::Utc::now().to_rfc3339()],
        )
        .context("saving run state")?;
        Ok(())
    }

    fn load(&self, run_id: &str) -> anyhow::Result<Option<RunState>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT state_json FROM run_states WHERE run_id = ?1")
            .context("preparing load query")?;
        let mut rows = stmt.query([run_id]).context("querying run state")?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                let state = serde_json::from_str(&payload).context("decoding run state")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, run_id: &str) -> anyhow::Result<()> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM run_states WHERE run_id = ?1", [run_id])
            .context("deleting run state")?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
