// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod context;
mod exporter;
mod processor;
mod sqlite;

pub use context::{TelemetryContext, ToolExecutionContext, TurnContext};
pub use exporter::{
    write_with_retry, CompositeExporter, Exporter, ExporterHealth, HealthCounters, NoOpExporter,
};
pub use processor::ObservabilityProcessor;
pub use sqlite::{SqliteExporter, TelemetryStorage};
