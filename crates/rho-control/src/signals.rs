// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-based signal protocol for managing running agents.
//!
//! Signal directory: `~/.config/rho-agent/signals/` (override with
//! `RHO_AGENT_SIGNAL_DIR`).  Sentinel files keyed by session id:
//!
//! - `<id>.running`   — agent is alive; payload is [`AgentInfo`] JSON
//! - `<id>.cancel`    — cancel requested; sessions poll with a single stat
//! - `<id>.pause`     — session blocks at turn boundaries while present
//! - `<id>.directive` — JSONL queue of out-of-band user messages
//! - `<id>.export` / `<id>.context` — request/response for a transcript dump
//! - `<id>.response.<seq>` — latest assistant response for monitors to tail
//!
//! Appending to and consuming the directive queue take an exclusive file
//! lock; every other operation relies on create/stat/delete atomicity.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Resolve the signal directory, creating it if needed.
fn default_signal_dir() -> anyhow::Result<PathBuf> {
    let dir = match std::env::var("RHO_AGENT_SIGNAL_DIR") {
        Ok(v) => PathBuf::from(v),
        Err(_) => dirs::home_dir()
            .context("cannot resolve home directory")?
            .join(".config/rho-agent/signals"),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating signal dir {}", dir.display()))?;
    Ok(dir)
}

/// Information about a running agent, written to the `.running` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub session_id: String,
    pub pid: u32,
    pub model: String,
    pub instruction_preview: String,
    /// RFC 3339 start timestamp.
    pub started_at: String,
}

impl AgentInfo {
    pub fn new(session_id: &str, model: &str, instruction_preview: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            pid: std::process::id(),
            model: model.to_string(),
            instruction_preview: instruction_preview.chars().take(120).collect(),
            started_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Manages file-based signals for agent lifecycle coordination.
pub struct SignalManager {
    dir: PathBuf,
}

impl SignalManager {
    /// Open a manager over the default (env-resolved) signal directory.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            dir: default_signal_dir()?,
        })
    }

    /// Open a manager over an explicit directory (tests, embedders).
    pub fn with_dir(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating signal dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn running_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.running"))
    }

    fn cancel_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.cancel"))
    }

    fn pause_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.pause"))
    }

    fn directive_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.directive"))
    }

    fn export_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.export"))
    }

    fn context_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.context"))
    }

    fn response_path(&self, session_id: &str, seq: u64) -> PathBuf {
        self.dir.join(format!("{session_id}.response.{seq}"))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Write the `.running` file for this agent session.
    pub fn register(&self, info: &AgentInfo) -> anyhow::Result<()> {
        let payload = serde_json::to_string(info).context("serializing agent info")?;
        std::fs::write(self.running_path(&info.session_id), payload)
            .context("writing .running file")
    }

    /// Remove all sentinel files for this session.
    pub fn deregister(&self, session_id: &str) -> anyhow::Result<()> {
        let mut paths = vec![
            self.running_path(session_id),
            self.cancel_path(session_id),
            self.pause_path(session_id),
            self.directive_path(session_id),
            self.export_path(session_id),
            self.context_path(session_id),
        ];
        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            let response_prefix = format!("{session_id}.response.");
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&response_prefix)
                {
                    paths.push(entry.path());
                }
            }
        }
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        Ok(())
    }

    /// List all agents with `.running` files, most recent first.  Corrupt
    /// entries are skipped.
    pub fn list_running(&self) -> Vec<AgentInfo> {
        let mut agents = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return agents,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "running").unwrap_or(false) {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if let Ok(info) = serde_json::from_str::<AgentInfo>(&text) {
                        agents.push(info);
                    }
                }
            }
        }
        agents.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        agents
    }

    /// Remove `.running` entries whose pid is no longer alive.
    pub fn cleanup_stale(&self) -> anyhow::Result<Vec<String>> {
        let mut cleaned = Vec::new();
        for info in self.list_running() {
            if !pid_alive(info.pid) {
                self.deregister(&info.session_id)?;
                cleaned.push(info.session_id);
            }
        }
        Ok(cleaned)
    }

    // ── Cancel / pause / resume ───────────────────────────────────────────────

    /// Single-stat check used from the session's cancel path.
    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.cancel_path(session_id).exists()
    }

    /// Request cancellation.  Returns false when the session is not running.
    pub fn cancel(&self, session_id: &str) -> anyhow::Result<bool> {
        if !self.running_path(session_id).exists() {
            return Ok(false);
        }
        std::fs::write(self.cancel_path(session_id), "").context("writing .cancel file")?;
        Ok(true)
    }

    pub fn is_paused(&self, session_id: &str) -> bool {
        self.pause_path(session_id).exists()
    }

    pub fn pause(&self, session_id: &str) -> anyhow::Result<bool> {
        if !self.running_path(session_id).exists() {
            return Ok(false);
        }
        std::fs::write(self.pause_path(session_id), "").context("writing .pause file")?;
        Ok(true)
    }

    pub fn resume(&self, session_id: &str) -> anyhow::Result<bool> {
        let pause = self.pause_path(session_id);
        if !self.running_path(session_id).exists() && !pause.exists() {
            return Ok(false);
        }
        match std::fs::remove_file(&pause) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("removing .pause file"),
        }
        Ok(true)
    }

    /// Cancel every running session whose id starts with `prefix`.
    pub fn cancel_by_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut cancelled = Vec::new();
        for info in self.list_running() {
            if info.session_id.starts_with(prefix) && self.cancel(&info.session_id)? {
                cancelled.push(info.session_id);
            }
        }
        Ok(cancelled)
    }

    pub fn pause_by_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut paused = Vec::new();
        for info in self.list_running() {
            if info.session_id.starts_with(prefix) && self.pause(&info.session_id)? {
                paused.push(info.session_id);
            }
        }
        Ok(paused)
    }

    pub fn resume_by_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut resumed = Vec::new();
        for info in self.list_running() {
            if info.session_id.starts_with(prefix) && self.resume(&info.session_id)? {
                resumed.push(info.session_id);
            }
        }
        Ok(resumed)
    }

    pub fn cancel_all(&self) -> anyhow::Result<Vec<String>> {
        self.cancel_by_prefix("")
    }

    // ── Directives ────────────────────────────────────────────────────────────

    /// Queue an out-of-band user message for a running session.
    pub fn queue_directive(&self, session_id: &str, directive: &str) -> anyhow::Result<bool> {
        if !self.running_path(session_id).exists() {
            return Ok(false);
        }
        let payload = json!({
            "directive": directive,
            "created_at": Utc::now().to_rfc3339(),
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(self.directive_path(session_id))
            .context("opening directive queue")?;
        file.lock_exclusive().context("locking directive queue")?;
        let result = writeln!(file, "{payload}").and_then(|_| file.flush());
        let unlock = file.unlock();
        result.context("appending directive")?;
        unlock.context("unlocking directive queue")?;
        Ok(true)
    }

    /// Read and clear queued directives.  Consuming truncates the queue
    /// under the same exclusive lock that writers take.
    pub fn consume_directives(&self, session_id: &str) -> anyhow::Result<Vec<String>> {
        let path = self.directive_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context("opening directive queue")?;
        file.lock_exclusive().context("locking directive queue")?;
        let mut text = String::new();
        let io_result = file
            .read_to_string(&mut text)
            .and_then(|_| file.set_len(0))
            .and_then(|_| file.seek(SeekFrom::Start(0)).map(|_| ()));
        let unlock = file.unlock();
        io_result.context("draining directive queue")?;
        unlock.context("unlocking directive queue")?;

        let mut directives = Vec::new();
        for line in text.lines() {
            let payload: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => continue, // torn line, skip
            };
            if let Some(directive) = payload.get("directive").and_then(|d| d.as_str()) {
                let trimmed = directive.trim();
                if !trimmed.is_empty() {
                    directives.push(trimmed.to_string());
                }
            }
        }
        Ok(directives)
    }

    // ── Context export and responses ──────────────────────────────────────────

    /// Ask a running session to dump its transcript.
    pub fn request_export(&self, session_id: &str) -> anyhow::Result<bool> {
        if !self.running_path(session_id).exists() {
            return Ok(false);
        }
        std::fs::write(self.export_path(session_id), "").context("writing .export file")?;
        Ok(true)
    }

    /// Session side: was an export requested?
    pub fn export_requested(&self, session_id: &str) -> bool {
        self.export_path(session_id).exists()
    }

    /// Session side: write the transcript and clear the request sentinel.
    pub fn write_context(&self, session_id: &str, transcript: &str) -> anyhow::Result<()> {
        std::fs::write(self.context_path(session_id), transcript)
            .context("writing .context file")?;
        match std::fs::remove_file(self.export_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("clearing .export file"),
        }
    }

    /// Monitor side: read an exported transcript, if present.
    pub fn read_context(&self, session_id: &str) -> Option<String> {
        std::fs::read_to_string(self.context_path(session_id)).ok()
    }

    /// Publish the latest assistant response under a monotonic counter.
    pub fn write_response(&self, session_id: &str, seq: u64, text: &str) -> anyhow::Result<()> {
        let path = self.response_path(session_id, seq);
        debug!(path = %path.display(), "publishing response");
        std::fs::write(path, text).context("writing response file")
    }

    /// Latest `(seq, text)` response for a session, if any.
    pub fn latest_response(&self, session_id: &str) -> Option<(u64, String)> {
        let prefix = format!("{session_id}.response.");
        let mut best: Option<(u64, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir).ok()?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(seq) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
                if best.as_ref().map(|(b, _)| seq > *b).unwrap_or(true) {
                    best = Some((seq, entry.path()));
                }
            }
        }
        let (seq, path) = best?;
        std::fs::read_to_string(path).ok().map(|text| (seq, text))
    }
}

/// Check whether a pid refers to a live process.
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) probes existence without sending a signal.  EPERM means
    // the process exists but belongs to someone else — still alive.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
