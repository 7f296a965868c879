// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.

use serde::Deserialize;

use crate::Usage;

/// Metadata for a single model.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelCatalogEntry {
    /// Model identifier as sent to the API (e.g. "gpt-5-mini").
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Total context window in tokens.
    pub context_window: u64,
    /// Maximum output tokens per completion.
    pub max_output_tokens: u64,
    /// USD per 1M input tokens.
    pub input_price: f64,
    /// USD per 1M cached input tokens.
    pub cached_input_price: f64,
    /// USD per 1M output tokens.
    pub output_price: f64,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelCatalogEntry>,
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by id (or display name).
pub fn lookup(model: &str) -> Option<ModelCatalogEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == model || e.name == model)
}

/// Context window for a model, when known.
pub fn context_window(model: &str) -> Option<u64> {
    lookup(model).map(|e| e.context_window)
}

/// Compute the USD cost of one call from its token counts.
///
/// Cached prompt tokens are billed at the cached rate; the remainder of the
/// input at the full rate.  Returns `None` when the model is not in the
/// catalog (the caller leaves `cost_usd` at zero rather than guessing).
pub fn cost_usd(model: &str, usage: &Usage) -> Option<f64> {
    let entry = lookup(model)?;
    let fresh_input = usage.input_tokens.saturating_sub(usage.cached_tokens) as f64;
    let cached = usage.cached_tokens as f64;
    let output = usage.output_tokens as f64;
    Some(
        fresh_input * entry.input_price / 1e6
            + cached * entry.cached_input_price / 1e6
            + output * entry.output_price / 1e6,
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
