// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "rho-agent",
    version,
    about = "Agent harness: capability-scoped tools, durable sessions, cross-process control"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit tracing output to stderr (RUST_LOG also honoured).
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one prompt headlessly and stream the answer to stdout.
    Run {
        /// The user prompt.
        prompt: String,

        /// Agent config YAML file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Capability profile: readonly, developer, eval, or a YAML path.
        #[arg(long)]
        profile: Option<String>,

        /// Model identifier override.
        #[arg(long)]
        model: Option<String>,

        /// Base directory for session persistence
        /// (default: ~/.local/share/rho-agent/sessions).
        #[arg(long)]
        session_dir: Option<PathBuf>,

        /// Maximum model round-trips per run.
        #[arg(long)]
        max_turns: Option<u32>,

        /// Disable automatic context compaction.
        #[arg(long)]
        no_auto_compact: bool,

        /// Enable continuation nudges (eval mode).
        #[arg(long)]
        nudge: bool,

        /// SQLite telemetry database; omitting disables telemetry.
        #[arg(long)]
        telemetry_db: Option<PathBuf>,
    },

    /// Inspect and control running sessions through the signal directory.
    Signals {
        #[command(subcommand)]
        command: SignalCommands,
    },

    /// Print a transcript reconstructed from a trace.jsonl file.
    Replay {
        /// Path to the trace file.
        trace: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum SignalCommands {
    /// List running sessions.
    List,
    /// Request cancellation of a session (or all with a prefix).
    Cancel {
        session_id: String,
        /// Treat SESSION_ID as a prefix and cancel every match.
        #[arg(long)]
        prefix: bool,
    },
    /// Cancel every running session.
    CancelAll,
    /// Pause a session at its next turn boundary.
    Pause { session_id: String },
    /// Resume a paused session.
    Resume { session_id: String },
    /// Queue an out-of-band user message for a running session.
    Directive { session_id: String, text: String },
    /// Remove .running entries whose process is gone.
    Cleanup,
}
