// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

/// Write a file.  In create-only mode, overwriting an existing file is
/// refused; full mode replaces the file contents.
pub struct WriteFileTool {
    pub create_only: bool,
    pub requires_approval: bool,
}

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Destination file path." },
                "content": { "type": "string", "description": "Full file content to write." }
            },
            "required": ["path", "content"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let path = match invocation.str_arg("path") {
            Some(p) => p,
            None => return Ok(ToolOutput::err("Missing required 'path' argument")),
        };
        let content = invocation.str_arg("content").unwrap_or_default();

        let target = std::path::Path::new(path);
        if self.create_only && target.exists() {
            return Ok(ToolOutput::err(format!(
                "Refusing to overwrite existing file {path} (create-only mode)"
            )));
        }
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Ok(ToolOutput::err(format!(
                        "Cannot create directory {}: {e}",
                        parent.display()
                    )));
                }
            }
        }
        if let Err(e) = std::fs::write(target, content) {
            return Ok(ToolOutput::err(format!("Cannot write {path}: {e}")));
        }

        let mut metadata = Map::new();
        metadata.insert("bytes_written".into(), json!(content.len()));
        Ok(ToolOutput::ok(format!("Wrote {} bytes to {path}", content.len())).with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
