//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AgentDaemon - autonomous agent runtime
#[derive(Parser)]
#[command(
    name = "agentdaemon",
    about = "Autonomous agent runtime with a controller/worker IPC plane",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker process in the foreground
    Run,

    /// Manage the detached worker process
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Send lifecycle commands to the worker (controller surface)
    Agent {
        #[command(subcommand)]
        command: AgentCtl,
    },

    /// Show worker status from shared state and the cycle journal
    Status,

    /// Show recent cycles from the journal
    Cycles {
        /// Maximum rows to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Filter by action name
        #[arg(short, long)]
        action: Option<String>,

        /// Only failed cycles
        #[arg(long)]
        failed: bool,
    },
}

/// Worker process management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Spawn the worker as a detached process
    Start,
    /// Stop the detached worker
    Stop,
    /// Show worker process status
    Status,
}

/// Controller commands delivered through the command queue
#[derive(Debug, Subcommand)]
pub enum AgentCtl {
    /// Start agent cycles
    Start,
    /// Stop agent cycles (the process keeps running)
    Stop,
    /// Pause agent cycles
    Pause,
    /// Resume agent cycles
    Resume,
    /// Shut the worker process down
    Shutdown,
    /// Reload worker configuration
    ReloadConfig,
    /// Execute a single action out-of-band
    Exec {
        /// Action name
        action: String,
    },
}
