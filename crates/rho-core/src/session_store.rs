// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session directory persistence.
//!
//! Each session owns a directory holding everything needed to inspect or
//! resume it:
//!
//! - `config.yaml` — the agent config the session started with
//! - `trace.jsonl` — the state event log (the durable record)
//! - `meta.json`   — pid, model, status, started_at
//! - `cancel` / `pause` — optional control sentinels

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use rho_config::AgentConfig;
use serde::{Deserialize, Serialize};

use crate::state::State;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub pid: u32,
    pub model: String,
    pub status: String,
    pub started_at: String,
}

#[derive(Debug, Clone)]
pub struct SessionDir {
    root: PathBuf,
    session_id: String,
}

impl SessionDir {
    /// Default base: `~/.local/share/rho-agent/sessions`.
    pub fn default_base() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("rho-agent/sessions")
    }

    /// Create (or open) the directory for a session under `base`.
    pub fn create(base: &Path, session_id: &str) -> anyhow::Result<Self> {
        let root = base.join(session_id);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating session dir {}", root.display()))?;
        Ok(Self {
            root,
            session_id: session_id.to_string(),
        })
    }

    /// Open an existing session directory; errors when it does not exist.
    pub fn open(base: &Path, session_id: &str) -> anyhow::Result<Self> {
        let root = base.join(session_id);
        if !root.is_dir() {
            anyhow::bail!("no session directory at {}", root.display());
        }
        Ok(Self {
            root,
            session_id: session_id.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trace_path(&self) -> PathBuf {
        self.root.join("trace.jsonl")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    pub fn cancel_sentinel(&self) -> PathBuf {
        self.root.join("cancel")
    }

    pub fn pause_sentinel(&self) -> PathBuf {
        self.root.join("pause")
    }

    pub fn write_config(&self, config: &AgentConfig) -> anyhow::Result<()> {
        config.to_file(self.config_path())
    }

    pub fn load_config(&self) -> anyhow::Result<AgentConfig> {
        AgentConfig::from_file(self.config_path())
    }

    pub fn write_meta(&self, model: &str, status: &str) -> anyhow::Result<()> {
        let meta = SessionMeta {
            session_id: self.session_id.clone(),
            pid: std::process::id(),
            model: model.to_string(),
            status: status.to_string(),
            started_at: Utc::now().to_rfc3339(),
        };
        let text = serde_json::to_string_pretty(&meta).context("serializing meta")?;
        std::fs::write(self.meta_path(), text)
            .with_context(|| format!("writing {}", self.meta_path().display()))
    }

    pub fn load_meta(&self) -> anyhow::Result<SessionMeta> {
        let text = std::fs::read_to_string(self.meta_path())
            .with_context(|| format!("reading {}", self.meta_path().display()))?;
        serde_json::from_str(&text).context("decoding meta.json")
    }

    /// Update only the status field, preserving the original start time.
    pub fn update_status(&self, status: &str) -> anyhow::Result<()> {
        let mut meta = self.load_meta()?;
        meta.status = status.to_string();
        let text = serde_json::to_string_pretty(&meta).context("serializing meta")?;
        std::fs::write(self.meta_path(), text)
            .with_context(|| format!("writing {}", self.meta_path().display()))
    }

    /// Reconstruct the conversation state from the trace log.
    pub fn load_state(&self) -> anyhow::Result<State> {
        let bytes = std::fs::read(self.trace_path())
            .with_context(|| format!("reading {}", self.trace_path().display()))?;
        State::from_jsonl(&bytes)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_and_reads_meta() {
        let base = tempfile::tempdir().unwrap();
        let dir = SessionDir::create(base.path(), "sess-1").unwrap();
        dir.write_meta("gpt-5-mini", "running").unwrap();
        let meta = dir.load_meta().unwrap();
        assert_eq!(meta.session_id, "sess-1");
        assert_eq!(meta.model, "gpt-5-mini");
        assert_eq!(meta.status, "running");
        assert_eq!(meta.pid, std::process::id());
    }

    #[test]
    fn update_status_preserves_started_at() {
        let base = tempfile::tempdir().unwrap();
        let dir = SessionDir::create(base.path(), "sess-1").unwrap();
        dir.write_meta("m", "running").unwrap();
        let before = dir.load_meta().unwrap().started_at;
        dir.update_status("completed").unwrap();
        let meta = dir.load_meta().unwrap();
        assert_eq!(meta.status, "completed");
        assert_eq!(meta.started_at, before);
    }

    #[test]
    fn config_round_trips_through_session_dir() {
        let base = tempfile::tempdir().unwrap();
        let dir = SessionDir::create(base.path(), "sess-1").unwrap();
        let config = AgentConfig {
            system_prompt: "investigate".into(),
            profile: "developer".into(),
            ..AgentConfig::default()
        };
        dir.write_config(&config).unwrap();
        let loaded = dir.load_config().unwrap();
        assert_eq!(loaded.system_prompt, "investigate");
        assert_eq!(loaded.profile, "developer");
    }

    #[test]
    fn state_reloads_from_trace() {
        let base = tempfile::tempdir().unwrap();
        let dir = SessionDir::create(base.path(), "sess-1").unwrap();
        let mut state = State::new();
        state.set_trace_path(dir.trace_path());
        state.add_user_message("question");
        state.add_assistant_message("answer");

        let restored = dir.load_state().unwrap();
        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.messages[0].content.as_deref(), Some("question"));
    }

    #[test]
    fn open_missing_session_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        assert!(SessionDir::open(base.path(), "ghost").is_err());
    }
}
