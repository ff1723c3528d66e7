use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use warden::cli::{Cli, Command};
use warden::config::{self, WardenConfig};
use warden::controller::{OperationResult, SupervisorController};
use warden::diagnose;
use warden::escalator::KillOutcome;
use warden::log::{ExecutionLog, Fanout, Observer, TracingObserver};
use warden::monitor::Monitor;
use warden::shell_completion;

fn print_operation(result: &OperationResult) {
    let tag = if result.success { "ok" } else { "FAILED" };
    println!("[warden] {tag}: {} ({}ms)", result.message, result.duration_ms);
    for attempt in &result.attempts {
        let outcome = match &attempt.outcome {
            KillOutcome::Success => "success".to_string(),
            KillOutcome::Failed(detail) => format!("failed: {detail}"),
            KillOutcome::Error(detail) => format!("error: {detail}"),
            KillOutcome::NoTargets => "no targets".to_string(),
        };
        println!(
            "  round {} {:<22} {:<28} {outcome}",
            attempt.round,
            attempt.strategy.label(),
            attempt.target.to_string()
        );
    }
}

fn finish(result: OperationResult) -> Result<()> {
    print_operation(&result);
    if result.success {
        Ok(())
    } else {
        anyhow::bail!("{}", result.message)
    }
}

fn build_observer(config: &WardenConfig, root: &Path) -> Result<Arc<dyn Observer>> {
    let mut fanout = Fanout::new().with(Arc::new(TracingObserver));
    if let Some(path) = config.event_log_path(root) {
        let log = ExecutionLog::new(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        fanout = fanout.with(Arc::new(log));
    }
    Ok(Arc::new(fanout))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet_command = matches!(
        &cli.command,
        Command::Config { .. } | Command::Completions { .. } | Command::Logs { .. }
    );

    let filter = match cli.verbose {
        0 if quiet_command => "warden=warn",
        0 => "warden=info",
        1 => "warden=debug",
        _ => "warden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Command::Completions { shell } = cli.command {
        return shell_completion::print(shell);
    }

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = match &cli.config {
        Some(path) => (WardenConfig::load_file(path)?, Some(path.clone())),
        None => WardenConfig::load(&cwd)?,
    };
    let root = config::project_root(config_path.as_deref(), &cwd);

    if !quiet_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .warden/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Config { json } => {
            if json {
                println!("{}", config::render_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", config::render_human(&config, config_path.as_deref()));
            }
            return Ok(());
        }
        Command::Logs { lines } => {
            let spec = config.to_spawn_spec(&root);
            let Some(path) = spec.log_file else {
                anyhow::bail!("no [spawn] log_file configured");
            };
            for line in diagnose::tail_lines(&path, lines)? {
                println!("{line}");
            }
            return Ok(());
        }
        _ => {}
    }

    let target = config.to_target()?;
    let spawn = config.to_spawn_spec(&root);
    let observer = build_observer(&config, &root)?;
    let controller = SupervisorController::system(target, spawn, observer);

    match cli.command {
        Command::Status { json } => {
            let report = controller.status();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("failed to serialize status")?
                );
            } else {
                let matched = if report.matched_processes.is_empty() {
                    "none".to_string()
                } else {
                    report
                        .matched_processes
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                println!("state:    {}", report.state.label());
                println!("port:     {}", controller.target().port);
                println!("matched:  {matched}");
                println!("method:   {:?}", report.method);
                println!("checked:  {}", report.checked_at.to_rfc3339());
                if !report.matched_processes.is_empty() {
                    match controller.describe(&report.matched_processes) {
                        Ok(details) => {
                            for p in details {
                                println!("  pid {} ({}): {}", p.pid, p.name, p.usage_summary());
                            }
                        }
                        Err(e) => warn!("could not read process details: {e}"),
                    }
                }
            }
        }
        Command::Start => finish(controller.start())?,
        Command::Stop => finish(controller.stop())?,
        Command::Restart => finish(controller.restart())?,
        Command::ForceKill => finish(controller.force_kill())?,
        Command::Diagnose { stop } => {
            print!("{}", diagnose::render(&controller.diagnose(), controller.target()));
            if stop {
                println!();
                finish(controller.stop())?;
            }
        }
        Command::Watch { interval_ms } => {
            let interval = interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or_else(|| config.monitor_interval());

            let (tx, rx) = mpsc::channel::<()>();
            ctrlc::set_handler(move || {
                let _ = tx.send(());
            })
            .context("failed to install Ctrl-C handler")?;

            let port = controller.target().port;
            let controller = Arc::new(controller);
            let monitor = Monitor::spawn(controller, interval, |report| {
                tracing::debug!(state = report.state.label(), "tick");
            })?;
            println!("[warden] watching port {port} every {}ms (Ctrl-C to stop)", interval.as_millis());

            if rx.recv().is_err() {
                warn!("Ctrl-C channel closed unexpectedly");
            }
            let ticks = monitor.stop();
            println!("[warden] stopped after {ticks} check(s)");
        }
        Command::Config { .. } | Command::Logs { .. } | Command::Completions { .. } => {}
    }

    Ok(())
}
