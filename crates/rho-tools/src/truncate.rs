// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool-output truncation with full-output persistence.
//!
//! Keeps the first and last half of the character budget so error messages
//! at the end of a command's output survive alongside its preamble.  The
//! untruncated output is persisted to a side file so a human (or the agent,
//! via the shell tool) can retrieve it.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

/// Default character budget for a stored tool result.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 20_000;

const OUTPUT_PERSIST_DIR: &str = "/tmp/rho-outputs";

#[derive(Debug, Clone)]
pub struct TruncateOptions {
    pub max_chars: usize,
    /// Tool name, used in the persisted filename.
    pub tool_name: String,
    /// Directory for full-output persistence; `None` disables it.
    pub persist_dir: Option<PathBuf>,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        Self {
            max_chars: max_chars_from_env(),
            tool_name: "tool".into(),
            persist_dir: Some(PathBuf::from(OUTPUT_PERSIST_DIR)),
        }
    }
}

impl TruncateOptions {
    pub fn for_tool(tool_name: &str) -> Self {
        Self {
            tool_name: tool_name.into(),
            ..Self::default()
        }
    }
}

/// Resolve the truncation budget, honouring `RHO_AGENT_OUTPUT_MAX_CHARS`.
fn max_chars_from_env() -> usize {
    std::env::var("RHO_AGENT_OUTPUT_MAX_CHARS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(MAX_TOOL_OUTPUT_CHARS)
}

/// Truncate tool output to the configured budget.
///
/// Under the limit the content is returned unchanged.  Over it, the first
/// and last `max_chars / 2` characters are kept around an elision notice
/// that states how much was dropped and where the full output was saved.
pub fn truncate_output(content: &str, options: &TruncateOptions) -> String {
    if content.len() <= options.max_chars {
        return content.to_string();
    }

    let half = options.max_chars / 2;
    let elided = content.len() - options.max_chars;

    let file_path = options
        .persist_dir
        .as_deref()
        .and_then(|dir| persist_full_output(content, &options.tool_name, dir));

    // Split on character boundaries; a byte split can land inside a UTF-8
    // sequence and panic.
    let head_end = floor_char_boundary(content, half);
    let tail_start = ceil_char_boundary(content, content.len() - half);

    let head_lines = content[..head_end].matches('\n').count() + 1;
    let mut notice = format!("\n\n[OUTPUT TRUNCATED: {elided} chars elided around line {head_lines}]");
    if let Some(path) = &file_path {
        notice.push_str(&format!("\nFull output: {}", path.display()));
    }
    notice.push_str("\nTip: Filter with grep/head/tail, or redirect to file and search.\n\n");

    format!("{}{}{}", &content[..head_end], notice, &content[tail_start..])
}

fn persist_full_output(content: &str, tool_name: &str, dir: &Path) -> Option<PathBuf> {
    if std::fs::create_dir_all(dir).is_err() {
        return None;
    }
    let digest = Sha256::digest(content.as_bytes());
    let short = hex_prefix(&digest, 12);
    let path = dir.join(format!("{tool_name}_{short}.txt"));
    if !path.exists() {
        if let Err(e) = std::fs::write(&path, content) {
            debug!(error = %e, path = %path.display(), "failed to persist full tool output");
            return None;
        }
    }
    Some(path)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
