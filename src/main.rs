//! devrack CLI entry point.
//!
//! Parses command-line arguments, loads `devrack.toml`, resolves the
//! requested targets, and runs the supervisor until SIGINT or SIGTERM,
//! printing prefixed output and status lines for every visible runnable.
//! `devrack exec -- <cmd>` runs a one-shot command through the ephemeral
//! runner instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use devrack::config::{self, Config};
use devrack::ephemeral::{CommandEvent, CommandRunner};
use devrack::events::SupervisorEvent;
use devrack::runnable::RunnableStatus;
use devrack::state_file::StateExporter;
use devrack::supervisor::Supervisor;
use devrack::targets;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Dependency-aware supervisor for local dev processes",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Runnable or group names to start (default: all).
    targets: Vec<String>,
    /// Path to the devrack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Max log lines kept per stream.
    #[arg(long)]
    max_lines: Option<usize>,
    /// Do not export the state file for external inspectors.
    #[arg(long)]
    no_state_file: bool,
    /// List configured runnables and groups, then exit.
    #[arg(long)]
    list: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a one-shot command under devrack's process-group discipline.
    Exec {
        /// Command line to run: devrack exec -- cmd args...
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Respects RUST_LOG; logs go to stderr, child output owns stdout.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Some(Commands::Exec { command }) = cli.command {
        return run_exec(command).await;
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => {
            let default = PathBuf::from("devrack.toml");
            if !default.exists() {
                bail!("no devrack.toml in the current directory (use --config)");
            }
            default
        }
    };
    let mut config = config::load_config(&config_path)?;
    if let Some(max_lines) = cli.max_lines {
        config.defaults.max_output_lines = Some(max_lines);
    }

    if cli.list {
        print_listing(&config);
        return Ok(ExitCode::SUCCESS);
    }
    if config.runnables.is_empty() {
        bail!("no runnables defined in {}", config_path.display());
    }

    let resolved = targets::resolve_targets(&config, &cli.targets)?;
    let supervisor = Supervisor::new(&config)?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    supervisor.bus().forward(event_tx);

    let exporter = if cli.no_state_file {
        None
    } else {
        let project_root = std::env::current_dir().context("failed to resolve current dir")?;
        Some(StateExporter::attach(
            &supervisor,
            &config_path,
            &project_root,
        ))
    };

    supervisor.start_all(&resolved).await?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<&'static str>();
    spawn_signal_listener(shutdown_tx);

    let printer = Printer::new(&supervisor);
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => printer.handle(&supervisor, &event),
            signal = shutdown_rx.recv() => {
                let label = signal.unwrap_or("signal");
                println!("{}", tool_message(&format!("received {}, shutting down", label)));
                break;
            }
        }
    }

    supervisor.stop_all().await;
    if let Some(exporter) = exporter {
        exporter.shutdown();
    }
    Ok(ExitCode::SUCCESS)
}

/// One-shot execution through the ephemeral runner; the exit code of the
/// command becomes the exit code of devrack.
async fn run_exec(command: Vec<String>) -> Result<ExitCode> {
    let command = shell_words::join(&command);
    let runner = CommandRunner::new(config::DEFAULT_MAX_OUTPUT_LINES);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    runner.set_listener(Box::new(move |event| {
        let _ = event_tx.send(event.clone());
    }));
    runner.run(&command, None, &[]).await?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<&'static str>();
    spawn_signal_listener(shutdown_tx);

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(CommandEvent::Output { line, .. }) => println!("{}", line),
                Some(CommandEvent::Exit { code, .. }) => {
                    return Ok(match code {
                        Some(0) => ExitCode::SUCCESS,
                        Some(code) => ExitCode::from(code.clamp(1, 255) as u8),
                        None => ExitCode::FAILURE,
                    });
                }
                None => return Ok(ExitCode::FAILURE),
            },
            _ = shutdown_rx.recv() => {
                runner.cancel().await;
                return Ok(ExitCode::FAILURE);
            }
        }
    }
}

/// Prefixed line printer for the non-interactive console.
struct Printer {
    names: HashMap<String, String>,
}

impl Printer {
    fn new(supervisor: &Supervisor) -> Self {
        let names = supervisor
            .get_all()
            .into_iter()
            .map(|state| (state.id, state.name))
            .collect();
        Self { names }
    }

    fn name<'a>(&'a self, id: &'a str) -> &'a str {
        self.names.get(id).map(String::as_str).unwrap_or(id)
    }

    fn handle(&self, supervisor: &Supervisor, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::Output { id, line, .. } => {
                println!("[{}] {}", self.name(id), line);
            }
            SupervisorEvent::StatusChange { id, status, error } => {
                let name = self.name(id);
                let line = match status {
                    RunnableStatus::Waiting => {
                        let deps = supervisor
                            .get(id)
                            .map(|state| state.waiting_for.join(", "))
                            .unwrap_or_default();
                        format_status(name, *status, Some(&deps))
                    }
                    _ => format_status(name, *status, error.as_deref()),
                };
                println!("{}", line);
            }
            SupervisorEvent::HiddenChange { .. } => {}
        }
    }
}

fn format_status(name: &str, status: RunnableStatus, detail: Option<&str>) -> String {
    let text = match (status, detail) {
        (RunnableStatus::Waiting, Some(deps)) if !deps.is_empty() => {
            format!("{} waiting for {}", name, deps)
        }
        (RunnableStatus::Error, Some(error)) => format!("{} failed: {}", name, error),
        _ => format!("{} {}", name, status),
    };
    tool_message(&text)
}

fn tool_message(text: &str) -> String {
    format!("◆ devrack: {}", text)
}

fn print_listing(config: &Config) {
    println!("runnables:");
    for (id, runnable) in &config.runnables {
        match &runnable.name {
            Some(name) if name != id => println!("  {} ({})", id, name),
            _ => println!("  {}", id),
        }
    }
    if !config.groups.is_empty() {
        println!("groups:");
        for (name, members) in &config.groups {
            println!("  {}: {}", name, members.join(", "));
        }
    }
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<&'static str>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send("SIGINT");
                }
                _ = sigterm.recv() => {
                    let _ = tx.send("SIGTERM");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send("ctrl-c");
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
