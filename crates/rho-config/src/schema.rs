// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Portable agent configuration.
//!
//! An [`AgentConfig`] captures what an agent *is* (system prompt, capability
//! profile) and how it talks to a model backend (model name, base URL,
//! service tier).  It is designed to live as a YAML file in version control
//! so teams can share and version agent definitions, and it is written into
//! every session directory so interrupted sessions can be resumed with the
//! exact configuration they started with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-5-mini".into())
}

fn default_profile() -> String {
    std::env::var("RHO_AGENT_PROFILE").unwrap_or_else(|_| "readonly".into())
}

/// Portable agent configuration.
///
/// Unknown YAML keys are preserved in `extras` so teams can stash custom
/// metadata (notes, owner, version) in their config files without breaking
/// deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt text.  Empty means "use the built-in default prompt".
    #[serde(default)]
    pub system_prompt: String,
    /// Model identifier forwarded to the provider API.
    #[serde(default = "default_model")]
    pub model: String,
    /// Capability profile: a built-in name ("readonly", "developer", "eval")
    /// or a path to a YAML profile file.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Working directory for shell and file tools.  `None` means the
    /// process's current directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Base URL override for OpenAI-compatible endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Provider service tier (e.g. "flex").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
    /// Reasoning effort for reasoning-capable models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    /// Response format object forwarded verbatim to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    /// When false, every approval-gated tool call prompts the caller.
    #[serde(default = "default_true")]
    pub auto_approve: bool,
    /// Context window override in tokens.  `None` falls back to the model
    /// catalog entry (auto-compaction is disabled when neither is known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    /// SQLite database files exposed to the agent through the sqlite tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<PathBuf>,
    /// Unknown YAML keys, preserved round-trip.
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_yaml::Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: default_model(),
            profile: default_profile(),
            working_dir: None,
            base_url: std::env::var("OPENAI_BASE_URL").ok(),
            service_tier: None,
            reasoning_effort: None,
            response_format: None,
            auto_approve: true,
            context_window: None,
            databases: Vec::new(),
            extras: BTreeMap::new(),
        }
    }
}

/// Default system prompt used when `system_prompt` is empty and no user
/// default file exists.
const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a capable investigative assistant operating inside an agent harness. \
You chain tool calls to inspect files, run commands, and query databases. \
Work step by step, verify your findings, and finish with a clear answer.";

impl AgentConfig {
    /// Load a config from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AgentConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save the config to a YAML file, creating parent directories.
    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_yaml::to_string(self).context("serializing config")?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Resolve the system prompt to final text.
    ///
    /// Resolution rules:
    /// - empty string: `~/.config/rho-agent/default.md` if present, else the
    ///   built-in default;
    /// - ends in `.md`: load that file as the prompt;
    /// - otherwise: the string itself is the prompt.
    pub fn resolve_system_prompt(&self) -> anyhow::Result<String> {
        if self.system_prompt.is_empty() {
            if let Some(home) = dirs::home_dir() {
                let user_default = home.join(".config/rho-agent/default.md");
                if user_default.is_file() {
                    return std::fs::read_to_string(&user_default)
                        .with_context(|| format!("reading {}", user_default.display()));
                }
            }
            return Ok(DEFAULT_SYSTEM_PROMPT.to_string());
        }
        if self.system_prompt.ends_with(".md") {
            let path = Path::new(&self.system_prompt);
            return std::fs::read_to_string(path)
                .with_context(|| format!("reading prompt file {}", path.display()));
        }
        Ok(self.system_prompt.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
