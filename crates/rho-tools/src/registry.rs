// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{Cancelled, ToolHandler, ToolInvocation, ToolOutput};

/// A tool schema as emitted to prompt builders — kept independent from the
/// model crate so the tools crate has no wire-format dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Central registry holding all available tools.
///
/// Immutable after a session freezes it; all methods take `&self` except
/// registration, so a frozen `Arc<ToolRegistry>` is safely shared.  Cloning
/// is shallow — handlers are shared through their `Arc`s — which is how a
/// session derives its own frozen copy from an agent's registry.
#[derive(Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: impl ToolHandler + 'static) {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Remove a handler by name; no-op when absent.
    pub fn unregister(&mut self, name: &str) {
        self.handlers.remove(name);
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Specs for all enabled tools, sorted ascending by name.
    ///
    /// Sorted order is load-bearing: tool specs are part of the prompt
    /// prefix, and any ordering change invalidates the provider's cache.
    pub fn get_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .handlers
            .values()
            .filter(|h| h.is_enabled())
            .map(|h| ToolSpec {
                name: h.name().to_string(),
                description: h.description().to_string(),
                parameters: h.parameters(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Whether the named tool must pass the approval gate.  Unknown and
    /// disabled tools answer `true`: the gate is the safe default for a
    /// name the registry cannot vouch for.
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        match self.handlers.get(tool_name) {
            Some(h) if h.is_enabled() => h.requires_approval(),
            _ => true,
        }
    }

    /// Dispatch an invocation to its handler.
    ///
    /// Never fails for model-caused problems: unknown and disabled tools,
    /// and handler errors, all come back as `Ok(ToolOutput { success:
    /// false, .. })` so the model can self-correct on the next turn.  The
    /// single `Err` case is [`Cancelled`], which propagates.
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> anyhow::Result<ToolOutput> {
        let handler = match self.handlers.get(&invocation.tool_name) {
            Some(h) => h,
            None => {
                return Ok(ToolOutput::err(format!(
                    "Unknown tool: {}",
                    invocation.tool_name
                )))
            }
        };
        if !handler.is_enabled() {
            return Ok(ToolOutput::err(format!(
                "Tool '{}' is currently disabled",
                invocation.tool_name
            )));
        }

        // Coerce argument types against the schema before the handler sees
        // them: some models emit string-typed scalars in strict-JSON mode.
        let coerced = coerce_arguments(&invocation.arguments, &handler.parameters());
        let coerced_invocation = ToolInvocation {
            call_id: invocation.call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            arguments: coerced,
        };

        match handler.handle(&coerced_invocation).await {
            Ok(output) => Ok(output),
            Err(e) if e.is::<Cancelled>() => Err(e),
            Err(e) => Ok(ToolOutput::err(format!(
                "Tool '{}' failed: {e:#}\nArguments: {}",
                invocation.tool_name,
                Value::Object(invocation.arguments.clone())
            ))),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce argument values toward the types the schema declares.
///
/// Unknown and failed coercions pass the original value through — the
/// handler decides what to do with it.
fn coerce_arguments(arguments: &Map<String, Value>, schema: &Value) -> Map<String, Value> {
    let properties = match schema.get("properties").and_then(Value::as_object) {
        Some(p) => p,
        None => return arguments.clone(),
    };

    let mut coerced = arguments.clone();
    for (key, value) in arguments {
        let expected = properties
            .get(key)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        let replacement = match (expected, value) {
            (Some("boolean"), Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            (Some("integer"), Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(Value::from)
            }
            (Some("number"), Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            _ => None,
        };
        if let Some(v) = replacement {
            coerced.insert(key.clone(), v);
        }
    }
    coerced
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
