//! AgentDaemon CLI entry point
//!
//! `ad run` is the worker process; the `ad agent` subcommands are the
//! controller surface, writing commands to the file-backed queue and reading
//! shared state back.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};

use agentdaemon::cli::{AgentCtl, Cli, Command, DaemonCommand};
use agentdaemon::config::Config;
use agentdaemon::daemon::DaemonManager;
use agentdaemon::worker::{AgentRunner, ScriptedExecutor, ScriptedPlanner};
use statestore::{CommandQueue, CommandType, CycleFilter, CycleJournal, StateStore};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentdaemon")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    let log_file =
        fs::File::create(log_dir.join("agentdaemon.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    debug!(?config.paths.state_root, "Loaded configuration");

    match cli.command {
        Command::Run => cmd_run(&config).await,
        Command::Daemon { command } => cmd_daemon(command),
        Command::Agent { command } => cmd_agent(&config, command),
        Command::Status => cmd_status(&config),
        Command::Cycles {
            limit,
            action,
            failed,
        } => cmd_cycles(&config, limit, action, failed),
    }
}

/// Run the worker loop in the foreground
async fn cmd_run(config: &Config) -> Result<()> {
    let state = StateStore::new(&config.paths.state_root)?;
    let commands = CommandQueue::new(config.paths.command_root())?;
    let journal = CycleJournal::open(&config.paths.cycle_db_path)?;

    DaemonManager::new().register_self()?;

    // Built-in collaborators keep the loop runnable without a model attached;
    // embedders swap in their own Planner/ActionExecutor
    let actions = vec![
        "observe".to_string(),
        "analyze".to_string(),
        "idle".to_string(),
    ];
    let planner = Arc::new(ScriptedPlanner::new(actions.clone()));
    let executor = Arc::new(ScriptedExecutor::new(actions));

    let runner = AgentRunner::new(
        state,
        commands,
        journal,
        planner,
        executor,
        config.worker_config(),
    );
    runner.run().await
}

fn cmd_daemon(command: DaemonCommand) -> Result<()> {
    let manager = DaemonManager::new();
    match command {
        DaemonCommand::Start => {
            let pid = manager.start()?;
            println!("Worker started (pid {pid})");
        }
        DaemonCommand::Stop => {
            manager.stop()?;
            println!("Worker stopped");
        }
        DaemonCommand::Status => {
            let status = manager.status();
            if status.running {
                println!("Worker running (pid {})", status.pid.unwrap_or(0));
            } else {
                println!("Worker not running");
            }
        }
    }
    Ok(())
}

/// Send a command through the queue and wait for the worker's answer
fn cmd_agent(config: &Config, command: AgentCtl) -> Result<()> {
    let queue = CommandQueue::new(config.paths.command_root())?;

    let (command_type, params) = match command {
        AgentCtl::Start => (CommandType::Start, None),
        AgentCtl::Stop => (CommandType::Stop, None),
        AgentCtl::Pause => (CommandType::Pause, None),
        AgentCtl::Resume => (CommandType::Resume, None),
        AgentCtl::Shutdown => (CommandType::Shutdown, None),
        AgentCtl::ReloadConfig => (CommandType::ReloadConfig, None),
        AgentCtl::Exec { action } => {
            let mut params = BTreeMap::new();
            params.insert("action".to_string(), serde_json::Value::from(action));
            (CommandType::ExecuteAction, Some(params))
        }
    };

    let sent = queue.send_command(command_type, params, 60.0)?;
    println!("Sent {:?} (id {})", command_type, sent.command_id);

    match queue.wait_for_command(&sent.command_id, 30.0, 0.5) {
        Some(done) => {
            println!("Status: {:?}", done.status);
            if let Some(result) = done.result {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            if let Some(error) = done.error {
                println!("Error: {error}");
            }
        }
        None => println!("No response within 30s (is the worker running?)"),
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let state = StateStore::new(&config.paths.state_root)?;
    let status = state.get_full_status(60.0)?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    let journal = CycleJournal::open(&config.paths.cycle_db_path)?;
    let stats = journal.get_stats(None, None)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_cycles(
    config: &Config,
    limit: usize,
    action: Option<String>,
    failed: bool,
) -> Result<()> {
    let journal = CycleJournal::open(&config.paths.cycle_db_path)?;
    let filter = CycleFilter {
        action,
        success: failed.then_some(false),
        ..Default::default()
    };

    for cycle in journal.get_recent_cycles(limit, 0, &filter)? {
        let marker = if cycle.execution_success { "ok " } else { "FAIL" };
        println!(
            "{} [{}] {} reward={:+.2} {}ms {}",
            cycle.timestamp.format("%Y-%m-%d %H:%M:%S"),
            marker,
            cycle.action_name,
            cycle.reward,
            cycle.total_duration_ms,
            cycle.execution_error.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}
