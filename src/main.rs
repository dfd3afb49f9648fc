use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use gcode_debugger::channel::{Channel, ConnectionState, Controller, DRIFT_LIMIT};
use gcode_debugger::config::{self, DebuggerConfig};
use gcode_debugger::engine::{Engine, GoBack, Program};
use gcode_debugger::events::SessionEvent;
use gcode_debugger::logs::SessionLogger;
use gcode_debugger::macros::SyncOptions;
use gcode_debugger::session::{dispatch, Observer, Session};
use gcode_debugger::time::ClockOffset;

/// Line-by-line G-code debugger for networked CNC controllers
#[derive(Parser, Debug)]
#[command(name = "gcode-debugger", version)]
struct Cli {
    /// Controller host name or address
    #[arg(long, global = true)]
    host: Option<String>,

    /// Controller HTTP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Config file (defaults to ~/.gcode-debugger/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print raw controller traffic and state pushes
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a program and debug it interactively
    Run {
        file: PathBuf,
        /// Breakpoint line index (repeatable)
        #[arg(long = "break", short)]
        breakpoints: Vec<usize>,
    },
    /// Reconcile local and controller macros once
    Sync {
        /// Proceed even if the clock offset exceeds the drift limit
        #[arg(long)]
        confirm_drift: bool,
        /// Use this offset (local minus controller, ms) instead of measuring
        #[arg(long, allow_hyphen_values = true)]
        offset_ms: Option<i64>,
    },
    /// Delete a macro locally and on the controller
    DeleteMacro { name: String },
    /// Measure and print the controller clock offset
    Offset,
}

struct Printer {
    verbose: bool,
}

#[async_trait]
impl Observer for Printer {
    async fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Inbound { .. } | SessionEvent::StateUpdate { .. } if !self.verbose => {}
            SessionEvent::EmergencyStopFailed { message } => {
                eprintln!("!!! {message} !!!");
            }
            other => {
                let (prefix, line) = other.transcript();
                println!("[{prefix}] {line}");
            }
        }
    }
}

fn load_settings(cli: &Cli) -> DebuggerConfig {
    let mut settings = config::load_or_default(cli.config.as_deref());
    if let Some(host) = &cli.host {
        settings.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.connection.port = port;
    }
    settings
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let settings = load_settings(&cli);
    let logger = match settings.log_dir_path() {
        Some(dir) => SessionLogger::new(&dir).await,
        None => None,
    };
    let (session, rx) = Session::new(settings).context("could not set up session")?;
    let printer = Printer { verbose: cli.verbose };
    let dispatcher = tokio::spawn(async move { dispatch(rx, &printer, logger).await });

    let result = match cli.command {
        Command::Run { file, breakpoints } => run(&session, &file, &breakpoints).await,
        Command::Sync {
            confirm_drift,
            offset_ms,
        } => {
            let options = SyncOptions {
                confirm_drift,
                offset_override: offset_ms.map(ClockOffset::from_millis),
            };
            let report = session.macros().sync(options).await.context("macro sync failed")?;
            println!("{}", report.summary());
            Ok(())
        }
        Command::DeleteMacro { name } => {
            let removed = session
                .macros()
                .delete(&name)
                .await
                .with_context(|| format!("could not delete macro {name}"))?;
            println!(
                "deleted {name} on controller{}",
                if removed { " and locally" } else { "" }
            );
            Ok(())
        }
        Command::Offset => {
            let offset = session
                .channel()
                .measure_offset()
                .await
                .context("could not read controller time")?;
            let note = if offset.exceeds(DRIFT_LIMIT) {
                " (exceeds drift limit)"
            } else {
                ""
            };
            println!("offset {offset}{note}");
            Ok(())
        }
    };

    session.shutdown().await;
    drop(session);
    // Background runs may still hold the event sink; give the transcript a
    // moment to flush rather than waiting on them.
    let _ = tokio::time::timeout(Duration::from_secs(1), dispatcher).await;
    result
}

async fn run(session: &Session, file: &Path, breakpoints: &[usize]) -> anyhow::Result<()> {
    let program =
        Program::load(file).with_context(|| format!("could not read {}", file.display()))?;
    let engine = session.engine();
    engine.load(program)?;
    for &line in breakpoints {
        engine.set_breakpoint(line)?;
    }

    if let Err(e) = session.connect().await {
        eprintln!("not connected: {e} (annotations are still shown while stepping)");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(input) = lines.next_line().await? {
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }
        if let Err(e) = command(session, &engine, input).await {
            eprintln!("error: {e:#}");
        }
    }
    Ok(())
}

fn index_arg(arg: Option<&str>) -> anyhow::Result<usize> {
    let arg = arg.context("expected a line index")?;
    arg.parse().with_context(|| format!("not a line index: {arg}"))
}

async fn command(session: &Session, engine: &Arc<Engine<Channel>>, input: &str) -> anyhow::Result<()> {
    let mut parts = input.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    match verb {
        "step" | "s" => {
            let result = engine.step_over().await?;
            if let Some(error) = result.controller_error {
                println!("line {}: controller reported {error}", result.index);
            }
        }
        "continue" | "c" => {
            // Runs in the background so pause/stop/estop stay available.
            let engine = engine.clone();
            tokio::spawn(async move {
                match engine.continue_run().await {
                    Ok(outcome) => println!("run ended: {outcome:?}"),
                    Err(e) => eprintln!("run failed: {e}"),
                }
            });
        }
        "to" => {
            let target = index_arg(parts.next())?;
            let engine = engine.clone();
            tokio::spawn(async move {
                match engine.step_to(target).await {
                    Ok(outcome) => println!("run ended: {outcome:?}"),
                    Err(e) => eprintln!("run failed: {e}"),
                }
            });
        }
        "back" | "b" => match engine.go_back().await? {
            GoBack::Restored { index, commands } => {
                println!("back at line {index} ({} restore commands)", commands.len())
            }
            GoBack::NoHistory => println!("nothing to go back to"),
        },
        "skip" => {
            let index = engine.skip_line()?;
            println!("at line {index}");
        }
        "skipto" => engine.skip_to(index_arg(parts.next())?)?,
        "break" => {
            let line = index_arg(parts.next())?;
            let set = engine.toggle_breakpoint(line)?;
            println!("breakpoint at {line} {}", if set { "set" } else { "cleared" });
        }
        "edit" => {
            let line = index_arg(parts.next())?;
            let text = parts.next().context("expected replacement text")?;
            engine.edit_line(line, text)?;
        }
        "requeue" => {
            let line = index_arg(parts.next())?;
            engine.requeue_line(line)?;
        }
        "pause" => engine.pause().await?,
        "stop" => engine.stop().await?,
        "estop" | "!" => engine.emergency_stop().await?,
        "reset" => engine.reset().await?,
        "status" => {
            let status = engine.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            let channel = session.channel();
            if channel.connection_state() == ConnectionState::Connected {
                match channel.refresh_state().await {
                    Ok(machine) if machine.is_estopped() => println!("controller is ESTOPPED"),
                    Ok(_) => println!("controller {}", serde_json::to_string(&channel.raw_state())?),
                    Err(e) => eprintln!("could not refresh controller state: {e}"),
                }
            }
            let retrying = if channel.is_active() { "" } else { ", not reconnecting" };
            println!("connection {:?}{retrying}", channel.connection_state());
        }
        "save" => {
            let program = engine.program().context("no program loaded")?;
            let path = match parts.next() {
                Some(path) => PathBuf::from(path),
                None => program
                    .path()
                    .map(Path::to_path_buf)
                    .context("program has no path; give one")?,
            };
            program
                .save(&path)
                .with_context(|| format!("could not write {}", path.display()))?;
            println!("saved {}", path.display());
        }
        "sync" => {
            let confirm_drift = parts.next() == Some("--confirm-drift");
            let macros = session.macros();
            tokio::spawn(async move {
                let options = SyncOptions {
                    confirm_drift,
                    ..SyncOptions::default()
                };
                if let Err(e) = macros.sync(options).await {
                    eprintln!("sync failed: {e}");
                }
            });
        }
        other => bail!("unknown command {other:?}"),
    }
    Ok(())
}
