// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

/// Read a text file, optionally windowed by line offset and limit.
pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Use offset/limit to window large files; line \
         numbers in the output are 1-based."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute or relative file path." },
                "offset": { "type": "integer", "description": "1-based first line to read (optional)." },
                "limit": { "type": "integer", "description": "Maximum number of lines (optional)." }
            },
            "required": ["path"]
        })
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let path = match invocation.str_arg("path") {
            Some(p) => p,
            None => return Ok(ToolOutput::err("Missing required 'path' argument")),
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => return Ok(ToolOutput::err(format!("Cannot read {path}: {e}"))),
        };

        let offset = invocation.u64_arg("offset").unwrap_or(1).max(1) as usize;
        let limit = invocation.u64_arg("limit").unwrap_or(u64::MAX) as usize;
        let total_lines = text.lines().count();

        let content: String = text
            .lines()
            .enumerate()
            .skip(offset - 1)
            .take(limit)
            .map(|(i, line)| format!("{}\t{line}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = Map::new();
        metadata.insert("total_lines".into(), json!(total_lines));
        Ok(ToolOutput::ok(content).with_metadata(metadata))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn invocation(args: Value) -> ToolInvocation {
        ToolInvocation::new("c", "read_file", args.as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn reads_whole_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();
        let out = ReadFileTool
            .handle(&invocation(json!({"path": path.to_str().unwrap()})))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.content, "1\talpha\n2\tbeta");
        assert_eq!(out.metadata["total_lines"], json!(2));
    }

    #[tokio::test]
    async fn offset_and_limit_window_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        let out = ReadFileTool
            .handle(&invocation(
                json!({"path": path.to_str().unwrap(), "offset": 2, "limit": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(out.content, "2\tb\n3\tc");
    }

    #[tokio::test]
    async fn missing_file_is_a_failure_output() {
        let out = ReadFileTool
            .handle(&invocation(json!({"path": "/no/such/file"})))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.contains("Cannot read"));
    }
}
