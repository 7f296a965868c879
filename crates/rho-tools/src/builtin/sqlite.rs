// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite query tool.
//!
//! In read-only mode the database file is opened with SQLITE_OPEN_READ_ONLY
//! *and* the statement is vetted before execution — both layers are needed
//! because ATTACH can escape a read-only handle.

use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::OpenFlags;
use serde_json::{json, Map, Value};

use crate::{ToolHandler, ToolInvocation, ToolOutput};

const MAX_ROWS: usize = 200;

pub struct SqliteTool {
    databases: Vec<PathBuf>,
    readonly: bool,
    requires_approval: bool,
}

impl SqliteTool {
    pub fn new(databases: Vec<PathBuf>, readonly: bool, requires_approval: bool) -> Self {
        Self {
            databases,
            readonly,
            requires_approval,
        }
    }

    fn resolve_database(&self, name: Option<&str>) -> Option<PathBuf> {
        match name {
            None => self.databases.first().cloned(),
            Some(n) => self
                .databases
                .iter()
                .find(|p| {
                    p.file_stem().map(|s| s.to_string_lossy() == n).unwrap_or(false)
                        || p.to_string_lossy() == n
                })
                .cloned(),
        }
    }
}

/// Reject statements that mutate when the tool is read-only.
fn is_readonly_statement(query: &str) -> bool {
    let first = query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    matches!(first.as_str(), "select" | "with" | "pragma" | "explain")
}

fn run_query(path: PathBuf, query: String, readonly: bool) -> anyhow::Result<(String, usize, usize)> {
    let conn = if readonly {
        rusqlite::Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?
    } else {
        rusqlite::Connection::open(&path)?
    };

    let mut stmt = conn.prepare(&query)?;
    let column_count = stmt.column_count();

    if column_count == 0 {
        // Mutation or DDL statement.
        let affected = stmt.execute([])?;
        return Ok((format!("OK, {affected} row(s) affected"), affected, 0));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([])?;
    let mut lines = vec![columns.join("\t")];
    let mut row_count = 0usize;
    while let Some(row) = rows.next()? {
        if row_count >= MAX_ROWS {
            lines.push(format!("[... row limit {MAX_ROWS} reached ...]"));
            break;
        }
        let mut cells = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let cell = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => "NULL".to_string(),
                rusqlite::types::ValueRef::Integer(v) => v.to_string(),
                rusqlite::types::ValueRef::Real(v) => v.to_string(),
                rusqlite::types::ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
                rusqlite::types::ValueRef::Blob(b) => format!("<blob {} bytes>", b.len()),
            };
            cells.push(cell);
        }
        lines.push(cells.join("\t"));
        row_count += 1;
    }
    Ok((lines.join("\n"), row_count, column_count))
}

#[async_trait]
impl ToolHandler for SqliteTool {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn description(&self) -> &str {
        "Run a SQL query against a configured SQLite database. Results are \
         tab-separated with a header row; at most 200 rows are returned."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The SQL statement to run." },
                "database": { "type": "string", "description": "Database name (file stem); defaults to the first configured database." }
            },
            "required": ["query"]
        })
    }

    fn requires_approval(&self) -> bool {
        self.requires_approval
    }

    fn is_enabled(&self) -> bool {
        !self.databases.is_empty()
    }

    async fn handle(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let query = match invocation.str_arg("query") {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => return Ok(ToolOutput::err("Missing required 'query' argument")),
        };
        let path = match self.resolve_database(invocation.str_arg("database")) {
            Some(p) => p,
            None => {
                let known: Vec<String> = self
                    .databases
                    .iter()
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .collect();
                return Ok(ToolOutput::err(format!(
                    "Unknown database; configured databases: {}",
                    known.join(", ")
                )));
            }
        };

        if self.readonly && !is_readonly_statement(&query) {
            return Ok(ToolOutput::err(
                "Only SELECT/WITH/PRAGMA/EXPLAIN statements are allowed in read-only mode",
            ));
        }

        let readonly = self.readonly;
        let result =
            tokio::task::spawn_blocking(move || run_query(path, query, readonly)).await?;

        match result {
            Ok((content, rows, columns)) => {
                let mut metadata = Map::new();
                metadata.insert("rows".into(), json!(rows));
                metadata.insert("columns".into(), json!(columns));
                Ok(ToolOutput::ok(content).with_metadata(metadata))
            }
            Err(e) => Ok(ToolOutput::err(format!("Query failed: {e}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
