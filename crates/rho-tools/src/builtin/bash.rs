// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shell execution with configurable restrictions.
//!
//! Two modes:
//! - restricted: only allowlisted read-only commands; redirections and
//!   mutating command words are rejected before anything runs;
//! - unrestricted: any command (the surrounding sandbox is the boundary).
//!
//! Output is combined stdout + stderr; `metadata` carries `exit_code` and
//! `duration_seconds`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::debug;

use crate::{ToolHandler, ToolInvocation, ToolOutput};

pub const DEFAULT_TIMEOUT_RESTRICTED: u64 = 120;
pub const DEFAULT_TIMEOUT_UNRESTRICTED: u64 = 300;

/// Read-only commands permitted in restricted mode.
const ALLOWED_COMMANDS: &[&str] = &[
    // File inspection
    "cat", "head", "tail", "less", "more",
    // Search
    "grep", "rg", "ag", "ack", "find", "locate", "which", "whereis",
    // Directory listing
    "ls", "tree", "du", "df",
    // File info
    "file", "stat", "wc", "md5sum", "sha256sum", "shasum",
    // Text processing
    "awk", "sed", "cut", "sort", "uniq", "tr", "column", "fmt", "fold", "nl",
    "expand", "unexpand",
    // Structured data
    "jq", "yq", "xmllint",
    // Archive inspection
    "tar", "unzip", "zipinfo", "zcat", "zless", "zgrep",
    // System info
    "pwd", "whoami", "hostname", "uname", "env", "printenv", "date", "uptime",
    "ps", "top", "free",
    // Networking (read-only)
    "ping", "curl", "wget", "dig", "nslookup", "host", "netstat", "ss",
    // Git (read-only usage expected)
    "git",
    // Misc
    "echo", "printf", "diff", "cmp", "comm", "hexdump", "xxd", "od", "strings",
];

/// Standalone command words that mutate state, blocked in restricted mode
/// anywhere in the command line.
const DANGEROUS_COMMAND_WORDS: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "chmod", "chown", "chgrp", "mkdir", "touch",
    "truncate", "shred", "dd", "mkfs", "mount", "umount", "kill", "pkill",
    "killall", "reboot", "shutdown", "halt", "poweroff", "systemctl",
    "service", "apt", "yum", "dnf", "brew", "pip", "npm", "yarn", "cargo",
    "sudo", "su", "doas", "tee",
];

pub struct BashTool {
    pub restricted: bool,
    pub working_dir: PathBuf,
    pub timeout_secs: u64,
    pub requires_approval: bool,
}

impl Default for BashTool {
    fn default() -> Self {
        Self {
            restricted: true,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout_secs: DEFAULT_TIMEOUT_RESTRICTED,
            requires_approval: false,
        }
    }
}

/// Remove heredoc body text so safety checks only inspect executed syntax.
fn strip_heredoc_bodies(command: &str) -> String {
    let re = regex::Regex::new(r#"<<-?\s*(['"]?)([A-Za-z_][A-Za-z0-9_]*)\1"#).unwrap();
    let mut result = Vec::new();
    let mut active_delimiter: Option<String> = None;
    for line in command.lines() {
        if let Some(delim) = &active_delimiter {
            if line.trim() == delim {
                active_delimiter = None;
            }
            continue;
        }
        result.push(line);
        if let Some(caps) = re.captures(line) {
            active_delimiter = Some(caps[2].to_string());
        }
    }
    result.join("\n")
}

/// First dangerous command word matched as a standalone token, if any.
fn contains_dangerous_word(command: &str) -> Option<&'static str> {
    let lowered = command.to_lowercase();
    for &word in DANGEROUS_COMMAND_WORDS {
        let pattern = format!(r"(^|[\s;&|(]){}($|[\s;&|)])", regex::escape(word));
        if regex::Regex::new(&pattern).unwrap().is_match(&lowered) {
            return Some(word);
        }
    }
    None
}

/// Extract the base command: first word of the first pipeline segment,
/// skipping leading VAR=value assignments.
fn extract_base_command(command: &str) -> Option<&str> {
    let mut head = command;
    if let Some(pos) = head.find('|') {
        head = &head[..pos];
    }
    for sep in ["&&", ";", "||"] {
        if let Some(pos) = head.find(sep) {
            head = &head[..pos];
        }
    }
    head.split_whitespace().find(|part| !part.contains('='))
}

/// Restricted-mode gate.  Returns `Err(reason)` when the command is blocked.
pub fn is_command_allowed(command: &str) -> Result<(), String> {
    let checked = strip_heredoc_bodies(command);

    if checked.contains('>') {
        return Err("Command contains dangerous pattern: >".into());
    }
    if let Some(word) = contains_dangerous_word(&checked) {
        return Err(format!("Command contains dangerous pattern: {word}"));
    }

    let base = match extract_base_command(&checked) {
        Some(b) => b,
        None => return Err("Could not parse command".into()),
    };
    if !ALLOWED_COMMANDS.contains(&base) {
        return Err(format!("Command '{base}' is not in the allowlist"));
    }
    Ok(())
}

#[async_trait]
impl ToolHandler for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        if self.restricted {
            "Execute a read-only shell command and return stdout + stderr. \
             Only inspection commands (grep, cat, find, ls, git, ...) are \
             permitted; redirections and mutating commands are blocked."
        } else {
            "Execute a shell command and return stdout + stderr. Prefer \
             non-interactive commands; avoid anything that requires a TTY."
        }
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute."
                },
                "timeout": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)."
                }
            },
            "required": ["command"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let command = match invocation.str_arg("command") {
            Some(c) if !c.trim().is_empty() => c.to_string(),
            _ => return Ok(ToolOutput::err("Missing required 'command' argument")),
        };
        let timeout_secs = invocation.u64_arg("timeout").unwrap_or(self.timeout_secs);

        if self.restricted {
            if let Err(reason) = is_command_allowed(&command) {
                return Ok(ToolOutput::err(format!("Command blocked: {reason}")));
            }
        }

        debug!(cmd = %command, restricted = self.restricted, "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&self.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Detach the child from the controlling terminal so it cannot open
        // /dev/tty and corrupt the caller's terminal state.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            cmd.output(),
        )
        .await;

        let duration = started.elapsed().as_secs_f64();
        let mut metadata = Map::new();
        metadata.insert(
            "duration_seconds".into(),
            json!((duration * 100.0).round() / 100.0),
        );

        match result {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !combined.is_empty() && !combined.ends_with('\n') {
                        combined.push('\n');
                    }
                    combined.push_str(&stderr);
                }
                let exit_code = output.status.code().unwrap_or(-1);
                metadata.insert("exit_code".into(), json!(exit_code));
                Ok(ToolOutput {
                    content: combined,
                    success: exit_code == 0,
                    metadata,
                })
            }
            Ok(Err(e)) => {
                Ok(ToolOutput::err(format!("Failed to spawn command: {e}")).with_metadata(metadata))
            }
            Err(_) => {
                metadata.insert("timed_out".into(), json!(true));
                Ok(
                    ToolOutput::err(format!("Command timed out after {timeout_secs}s"))
                        .with_metadata(metadata),
                )
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
