// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Capability profiles: declarative policy over the tool set.
//!
//! A profile is a static description of what an agent may touch — shell
//! reach, file writes, database mutations — and which tool calls must pass
//! the approval gate.  The [`crate::ToolFactory`] materializes a profile
//! into a concrete registry.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellMode {
    /// Only allowlisted read-only commands.
    Restricted,
    /// Any command (sandboxed or trusted environments).
    Unrestricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileWriteMode {
    Off,
    /// May create new files but never overwrite existing ones.
    CreateOnly,
    /// Create, overwrite, and edit.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseMode {
    #[serde(rename = "readonly")]
    ReadOnly,
    Mutations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// No tool ever prompts.
    None,
    /// Only the statically dangerous tools prompt.
    Dangerous,
    /// Every tool prompts.
    All,
}

fn default_shell_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub shell: ShellMode,
    pub file_write: FileWriteMode,
    pub database: DatabaseMode,
    pub approval: ApprovalMode,
    /// Register only the bash tool and nothing else.
    #[serde(default)]
    pub bash_only: bool,
    /// Allow the delegate sub-agent tool.  Forcibly cleared for child
    /// sessions so delegation cannot recurse.
    #[serde(default)]
    pub enable_delegate: bool,
    /// Default per-invocation shell timeout, seconds.
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// Per-tool approval overrides; an entry here wins over the mode rule.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub approval_overrides: BTreeMap<String, bool>,
}

/// Tools whose static flag marks them dangerous under `ApprovalMode::Dangerous`.
/// The shell is dangerous only when unrestricted; that case is handled in
/// [`CapabilityProfile::requires_tool_approval`].
const DANGEROUS_TOOLS: &[&str] = &["write_file", "edit_file", "delegate"];

impl CapabilityProfile {
    /// Inspection-only profile: restricted shell, no writes, read-only
    /// databases, nothing prompts.
    pub fn readonly() -> Self {
        Self {
            shell: ShellMode::Restricted,
            file_write: FileWriteMode::Off,
            database: DatabaseMode::ReadOnly,
            approval: ApprovalMode::None,
            bash_only: false,
            enable_delegate: false,
            shell_timeout_secs: 120,
            approval_overrides: BTreeMap::new(),
        }
    }

    /// Interactive development: full reach, dangerous calls prompt.
    pub fn developer() -> Self {
        Self {
            shell: ShellMode::Unrestricted,
            file_write: FileWriteMode::Full,
            database: DatabaseMode::Mutations,
            approval: ApprovalMode::Dangerous,
            bash_only: false,
            enable_delegate: true,
            shell_timeout_secs: 300,
            approval_overrides: BTreeMap::new(),
        }
    }

    /// Benchmark harness: full reach, nothing prompts (the sandbox is the
    /// safety boundary).
    pub fn eval() -> Self {
        Self {
            shell: ShellMode::Unrestricted,
            file_write: FileWriteMode::Full,
            database: DatabaseMode::Mutations,
            approval: ApprovalMode::None,
            bash_only: false,
            enable_delegate: false,
            shell_timeout_secs: 300,
            approval_overrides: BTreeMap::new(),
        }
    }

    /// Load a profile from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading profile {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing profile {}", path.display()))
    }

    /// Resolve a built-in profile name or a YAML path.
    pub fn load(name_or_path: &str) -> anyhow::Result<Self> {
        match name_or_path {
            "readonly" => return Ok(Self::readonly()),
            "developer" => return Ok(Self::developer()),
            "eval" => return Ok(Self::eval()),
            _ => {}
        }
        let path = Path::new(name_or_path);
        if path.exists() {
            return Self::from_yaml_file(path);
        }
        if let Some(home) = dirs::home_dir() {
            let candidate = home
                .join(".config/rho-agent/profiles")
                .join(format!("{name_or_path}.yaml"));
            if candidate.exists() {
                return Self::from_yaml_file(candidate);
            }
        }
        anyhow::bail!(
            "unknown profile '{name_or_path}': use readonly, developer, eval, \
             or a path to a YAML profile file"
        )
    }

    /// Whether calls to the named tool must pass the approval gate.
    pub fn requires_tool_approval(&self, tool_name: &str) -> bool {
        if let Some(&forced) = self.approval_overrides.get(tool_name) {
            return forced;
        }
        match self.approval {
            ApprovalMode::None => false,
            ApprovalMode::All => true,
            ApprovalMode::Dangerous => {
                if tool_name == "bash" {
                    return self.shell == ShellMode::Unrestricted;
                }
                if tool_name == "sqlite" {
                    return self.database == DatabaseMode::Mutations;
                }
                DANGEROUS_TOOLS.contains(&tool_name)
            }
        }
    }

    /// Copy of this profile with delegation stripped, for child sessions.
    pub fn without_delegate(&self) -> Self {
        Self {
            enable_delegate: false,
            ..self.clone()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
