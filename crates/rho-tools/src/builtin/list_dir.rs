// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

/// List a directory's entries, sorted, directories suffixed with `/`.
pub struct ListDirTool;

#[async_trait]
impl ToolHandler for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: current directory)." }
            }
        })
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let path = invocation.str_arg("path").unwrap_or(".");
        let entries = match std::fs::read_dir(path) {
            Ok(e) => e,
            Err(e) => return Ok(ToolOutput::err(format!("Cannot list {path}: {e}"))),
        };

        let mut names: Vec<String> = Vec::new();
        for entry in entries.flatten() {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let mut metadata = Map::new();
        metadata.insert("entries".into(), json!(names.len()));
        Ok(ToolOutput::ok(names.join("\n")).with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
