use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Supervise one long-running network service on this host",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Use this config file instead of searching for .warden/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe the service once and print its state
    Status {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the service unless it is already running
    Start,

    /// Stop the service, escalating through every strategy
    Stop,

    /// Stop the service, then start it again
    Restart,

    /// Stop the service with forced kills only
    #[command(name = "force-kill")]
    ForceKill,

    /// Show port owners and processes that look like the service
    Diagnose {
        /// Run a full stop after printing the report
        #[arg(long)]
        stop: bool,
    },

    /// Check status periodically until interrupted
    Watch {
        /// Override the monitor interval in milliseconds
        #[arg(long, value_name = "MS")]
        interval_ms: Option<u64>,
    },

    /// Print the tail of the service log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Show the effective configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
