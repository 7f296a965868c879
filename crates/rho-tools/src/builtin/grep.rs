// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

const MAX_MATCHES: usize = 200;

/// Regex search across a file or directory tree.
pub struct GrepTool;

fn search_file(path: &Path, re: &regex::Regex, matches: &mut Vec<String>) {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return, // binary or unreadable
    };
    for (i, line) in text.lines().enumerate() {
        if matches.len() >= MAX_MATCHES {
            return;
        }
        if re.is_match(line) {
            matches.push(format!("{}:{}: {}", path.display(), i + 1, line.trim_end()));
        }
    }
}

fn search_tree(path: &Path, re: &regex::Regex, matches: &mut Vec<String>) {
    if matches.len() >= MAX_MATCHES {
        return;
    }
    if path.is_file() {
        search_file(path, re, matches);
        return;
    }
    let entries = match std::fs::read_dir(path) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for child in paths {
        let name = child.file_name().map(|n| n.to_string_lossy().into_owned());
        if matches!(name.as_deref(), Some(n) if n.starts_with('.')) {
            continue;
        }
        search_tree(&child, re, matches);
    }
}

#[async_trait]
impl ToolHandler for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search for a regex pattern in a file or recursively in a directory. \
         Output lines are path:line: text; at most 200 matches are returned."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regular expression to search for." },
                "path": { "type": "string", "description": "File or directory to search (default: current directory)." }
            },
            "required": ["pattern"]
        })
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let pattern = match invocation.str_arg("pattern") {
            Some(p) => p,
            None => return Ok(ToolOutput::err("Missing required 'pattern' argument")),
        };
        let re = match regex::Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return Ok(ToolOutput::err(format!("Invalid regex: {e}"))),
        };
        let path = Path::new(invocation.str_arg("path").unwrap_or("."));

        let mut matches = Vec::new();
        search_tree(path, &re, &mut matches);

        let mut metadata = Map::new();
        metadata.insert("matches".into(), json!(matches.len()));
        if matches.is_empty() {
            return Ok(ToolOutput::ok("No matches").with_metadata(metadata));
        }
        let mut content = matches.join("\n");
        if matches.len() >= MAX_MATCHES {
            content.push_str("\n[match limit reached; use a more specific pattern]");
        }
        Ok(ToolOutput::ok(content).with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
