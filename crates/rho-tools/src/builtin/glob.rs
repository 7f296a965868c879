// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

const MAX_MATCHES: usize = 500;

/// Find files by glob pattern.  Supports `*`, `?`, and `**` (any depth).
pub struct GlobTool;

/// Compile a glob pattern into an anchored regex over the relative path.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` matches zero or more whole components.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:[^/]+/)*");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).ok()
}

fn walk(dir: &Path, root: &Path, re: &regex::Regex, matches: &mut Vec<String>) {
    if matches.len() >= MAX_MATCHES {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    for path in paths {
        if matches.len() >= MAX_MATCHES {
            return;
        }
        let relative = match path.strip_prefix(root) {
            Ok(r) => r.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        if path.is_dir() {
            // Skip hidden and VCS directories; they dominate walk time and
            // are never what the model is looking for.
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if matches!(name.as_deref(), Some(n) if n.starts_with('.')) {
                continue;
            }
            walk(&path, root, re, matches);
        } else if re.is_match(&relative) {
            matches.push(relative);
        }
    }
}

#[async_trait]
impl ToolHandler for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern (supports *, ?, and ** for any \
         depth), relative to the given root directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Glob pattern, e.g. src/**/*.rs" },
                "root": { "type": "string", "description": "Directory to search from (default: current directory)." }
            },
            "required": ["pattern"]
        })
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let pattern = match invocation.str_arg("pattern") {
            Some(p) => p,
            None => return Ok(ToolOutput::err("Missing required 'pattern' argument")),
        };
        let root = Path::new(invocation.str_arg("root").unwrap_or("."));
        let re = match glob_to_regex(pattern) {
            Some(r) => r,
            None => return Ok(ToolOutput::err(format!("Invalid glob pattern: {pattern}"))),
        };

        let mut matches = Vec::new();
        walk(root, root, &re, &mut matches);

        let mut metadata = Map::new();
        metadata.insert("matches".into(), json!(matches.len()));
        if matches.is_empty() {
            return Ok(ToolOutput::ok("No files matched").with_metadata(metadata));
        }
        Ok(ToolOutput::ok(matches.join("\n")).with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
