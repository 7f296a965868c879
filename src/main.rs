// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands, SignalCommands};
use rho_config::AgentConfig;
use rho_control::{AgentInfo, SignalManager};
use rho_core::{Agent, AgentEvent, RunOptions, RunStatus, Session, SessionDir, State};
use rho_model::Role;
use rho_observe::{
    Exporter, NoOpExporter, ObservabilityProcessor, SqliteExporter, TelemetryContext,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            prompt,
            config,
            profile,
            model,
            session_dir,
            max_turns,
            no_auto_compact,
            nudge,
            telemetry_db,
        } => {
            run_prompt(RunArgs {
                prompt,
                config,
                profile,
                model,
                session_dir,
                max_turns,
                no_auto_compact,
                nudge,
                telemetry_db,
            })
            .await
        }
        Commands::Signals { command } => run_signal_command(command),
        Commands::Replay { trace } => replay_trace(&trace),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct RunArgs {
    prompt: String,
    config: Option<PathBuf>,
    profile: Option<String>,
    model: Option<String>,
    session_dir: Option<PathBuf>,
    max_turns: Option<u32>,
    no_auto_compact: bool,
    nudge: bool,
    telemetry_db: Option<PathBuf>,
}

async fn run_prompt(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(profile) = args.profile {
        config.profile = profile;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let agent = Arc::new(Agent::new(config.clone())?);
    let mut session = Session::new(Arc::clone(&agent));
    session.auto_compact = !args.no_auto_compact;
    session.enable_nudge = args.nudge;
    let session_id = session.id().to_string();

    // Session persistence: config for resume, trace as the durable record.
    let base = args.session_dir.unwrap_or_else(SessionDir::default_base);
    let session_dir = SessionDir::create(&base, &session_id)?;
    session_dir.write_config(&config)?;
    session_dir.write_meta(agent.model(), "running")?;
    session.state_mut().set_trace_path(session_dir.trace_path());

    // Cross-process control: register, poll cancel/pause sentinels.
    let signals = Arc::new(SignalManager::new()?);
    signals.register(&AgentInfo::new(&session_id, agent.model(), &args.prompt))?;

    let cancel_signals = Arc::clone(&signals);
    let cancel_id = session_id.clone();
    let cancel_sentinel = session_dir.cancel_sentinel();
    session.set_cancel_check(Some(Arc::new(move || {
        cancel_signals.is_cancelled(&cancel_id) || cancel_sentinel.exists()
    })));

    let pause_signals = Arc::clone(&signals);
    let pause_id = session_id.clone();
    let pause_sentinel = session_dir.pause_sentinel();
    session.set_pause_check(Some(Arc::new(move || {
        pause_signals.is_paused(&pause_id) || pause_sentinel.exists()
    })));

    // Telemetry is opt-in; a missing db path means NoOp.
    let exporter: Arc<dyn Exporter> = match &args.telemetry_db {
        Some(path) => Arc::new(SqliteExporter::new(path)?),
        None => Arc::new(NoOpExporter),
    };
    let processor = Arc::new(tokio::sync::Mutex::new(ObservabilityProcessor::new(
        TelemetryContext::new(&session_id, agent.model(), &agent.config().profile),
        exporter,
    )));
    processor.lock().await.start_session().await;

    let mut response_seq: u64 = 0;
    let mut status = run_once(
        &mut session,
        &processor,
        &signals,
        &args.prompt,
        args.max_turns,
        &mut response_seq,
    )
    .await?;

    // Drain any directives queued while we were working; each becomes a
    // follow-up prompt in the same session.
    loop {
        handle_export_request(&signals, &session_id, session.state());
        let directives = signals.consume_directives(&session_id)?;
        if directives.is_empty() || status != RunStatus::Completed {
            break;
        }
        for directive in directives {
            status = run_once(
                &mut session,
                &processor,
                &signals,
                &directive,
                args.max_turns,
                &mut response_seq,
            )
            .await?;
            if status != RunStatus::Completed {
                break;
            }
        }
    }

    processor.lock().await.end_session(status.as_str()).await;
    session_dir.update_status(status.as_str())?;
    signals.deregister(&session_id)?;

    if status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

/// Run one prompt, printing streamed text and recording telemetry.
async fn run_once(
    session: &mut Session,
    processor: &Arc<tokio::sync::Mutex<ObservabilityProcessor>>,
    signals: &SignalManager,
    prompt: &str,
    max_turns: Option<u32>,
    response_seq: &mut u64,
) -> anyhow::Result<RunStatus> {
    let (events_tx, events_rx) = tokio::sync::mpsc::channel::<AgentEvent>(256);
    let (wrapped_tx, mut wrapped_rx) = tokio::sync::mpsc::channel::<AgentEvent>(256);

    // Print the mirrored stream so telemetry derivation cannot perturb what
    // the user sees.
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = wrapped_rx.recv().await {
            match event {
                AgentEvent::Text { content } => {
                    let _ = write!(stdout, "{content}");
                    let _ = stdout.flush();
                }
                AgentEvent::ToolStart { tool_name, .. } => {
                    eprintln!("[tool] {tool_name} ...");
                }
                AgentEvent::Error { message } => {
                    eprintln!("[error] {message}");
                }
                _ => {}
            }
        }
        let _ = writeln!(stdout);
    });

    let wrap = tokio::spawn({
        let processor = Arc::clone(processor);
        let user_input = prompt.to_string();
        async move {
            let mut guard = processor.lock().await;
            guard.wrap_turn(events_rx, wrapped_tx, &user_input).await;
        }
    });

    let result = session
        .run_with_options(
            prompt,
            RunOptions {
                max_turns,
                events_tx: Some(events_tx),
            },
        )
        .await;

    wrap.await.context("observability task failed")?;
    let _ = printer.await;

    *response_seq += 1;
    signals.write_response(session.id(), *response_seq, &result.text)?;

    Ok(result.status)
}

/// Answer a pending `.export` request with a readable transcript.
fn handle_export_request(signals: &SignalManager, session_id: &str, state: &State) {
    if signals.export_requested(session_id) {
        let transcript = render_transcript(state);
        if let Err(e) = signals.write_context(session_id, &transcript) {
            tracing::warn!(error = %e, "context export failed");
        }
    }
}

fn render_transcript(state: &State) -> String {
    let mut out = String::new();
    for message in state.get_messages() {
        match message.role {
            Role::User => {
                if let Some(content) = &message.content {
                    out.push_str(&format!("User: {content}\n\n"));
                }
            }
            Role::Assistant => {
                if let Some(content) = &message.content {
                    out.push_str(&format!("Assistant: {content}\n\n"));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        out.push_str(&format!(
                            "Assistant called tool: {}({})\n\n",
                            call.function.name, call.function.arguments
                        ));
                    }
                }
            }
            Role::Tool => {
                if let Some(content) = &message.content {
                    out.push_str(&format!("Tool result: {content}\n\n"));
                }
            }
            Role::System => {}
        }
    }
    out
}

fn run_signal_command(command: SignalCommands) -> anyhow::Result<()> {
    let signals = SignalManager::new()?;
    match command {
        SignalCommands::List => {
            let running = signals.list_running();
            if running.is_empty() {
                println!("no running sessions");
                return Ok(());
            }
            for info in running {
                println!(
                    "{}  pid={}  model={}  started={}  {}",
                    info.session_id, info.pid, info.model, info.started_at, info.instruction_preview
                );
            }
        }
        SignalCommands::Cancel { session_id, prefix } => {
            if prefix {
                let cancelled = signals.cancel_by_prefix(&session_id)?;
                println!("cancelled {} session(s)", cancelled.len());
            } else if signals.cancel(&session_id)? {
                println!("cancel requested for {session_id}");
            } else {
                anyhow::bail!("no running session {session_id}");
            }
        }
        SignalCommands::CancelAll => {
            let cancelled = signals.cancel_all()?;
            println!("cancelled {} session(s)", cancelled.len());
        }
        SignalCommands::Pause { session_id } => {
            if signals.pause(&session_id)? {
                println!("pause requested for {session_id}");
            } else {
                anyhow::bail!("no running session {session_id}");
            }
        }
        SignalCommands::Resume { session_id } => {
            if signals.resume(&session_id)? {
                println!("resumed {session_id}");
            } else {
                anyhow::bail!("no session {session_id}");
            }
        }
        SignalCommands::Directive { session_id, text } => {
            if signals.queue_directive(&session_id, &text)? {
                println!("directive queued for {session_id}");
            } else {
                anyhow::bail!("no running session {session_id}");
            }
        }
        SignalCommands::Cleanup => {
            let cleaned = signals.cleanup_stale()?;
            println!("removed {} stale session(s)", cleaned.len());
        }
    }
    Ok(())
}

fn replay_trace(trace: &PathBuf) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(trace).with_context(|| format!("reading {}", trace.display()))?;
    let state = State::from_jsonl(&bytes)?;
    print!("{}", render_transcript(&state));
    println!(
        "-- {} message(s), {} input + {} output tokens, status {}",
        state.messages.len(),
        state.usage.input_tokens,
        state.usage.output_tokens,
        state.status.as_str()
    );
    Ok(())
}
