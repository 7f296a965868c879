// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

/// Exact string replacement in an existing file.  `old_string` must match
/// exactly once unless `replace_all` is set.
pub struct EditFileTool {
    pub requires_approval: bool,
}

#[async_trait]
impl ToolHandler for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must be unique in the \
         file unless replace_all is true."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_string": { "type": "string" },
                "new_string": { "type": "string" },
                "replace_all": { "type": "boolean", "description": "Replace every occurrence (default false)." }
            },
            "required": ["path", "old_string", "new_string"]
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
        let old = match invocation.str_arg("old_string") {
            Some(s) if !s.is_empty() => s,
            _ => return Ok(ToolOutput::err("Missing required 'old_string' argument")),
        };
        let new = invocation.str_arg("new_string").unwrap_or_default();
        let replace_all = invocation.bool_arg("replace_all").unwrap_or(false);

        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => return Ok(ToolOutput::err(format!("Cannot read {path}: {e}"))),
        };

        let occurrences = text.matches(old).count();
        if occurrences == 0 {
            return Ok(ToolOutput::err(format!(
                "old_string not found in {path}"
            )));
        }
        if occurrences > 1 && !replace_all {
            return Ok(ToolOutput::err(format!(
                "old_string matches {occurrences} times in {path}; \
                 provide more context or set replace_all"
            )));
        }

        let updated = if replace_all {
            text.replace(old, new)
        } else {
            text.replacen(old, new, 1)
        };
        if let Err(e) = std::fs::write(path, updated) {
            return Ok(ToolOutput::err(format!("Cannot write {path}: {e}")));
        }

        let replaced = if replace_all { occurrences } else { 1 };
        let mut metadata = Map::new();
        metadata.insert("replacements".into(), json!(replaced));
        Ok(ToolOutput::ok(format!("Replaced {replaced} occurrence(s) in {path}"))
            .with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
