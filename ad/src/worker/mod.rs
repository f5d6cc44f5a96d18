//! Agent worker - the process that runs the cognitive loop
//!
//! The worker starts in the stopped state and waits for commands from the
//! controller through the file-backed queue. Each loop iteration sends a
//! heartbeat, polls for one command, and - when started and unpaused - runs
//! one plan / act / learn cycle, journaling the result and publishing
//! counters to shared state.

mod collaborators;

pub use collaborators::{
    ActionExecutor, ExecutionOutcome, PlannedAction, Planner, ScriptedExecutor, ScriptedPlanner,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use statestore::{
    AgentStatus, CommandQueue, CommandType, CycleInfo, CycleJournal, CycleLog, StateStore,
};
use tracing::{debug, error, info, warn};

use crate::learning::AdaptiveLearningModule;
use crate::metacognition::{
    HandoffChannel, Intervention, InterventionType, MetacognitiveMonitor, MonitorInputs,
};

/// Worker loop configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub personality: String,
    pub goal: String,
    /// Seconds between heartbeats
    pub heartbeat_interval: f64,
    /// Seconds between command polls
    pub command_poll_interval: f64,
    /// Sleep between cycles
    pub rest_time: f64,
    /// Sleep while stopped or paused
    pub idle_sleep: f64,
    /// Seconds between retention sweeps
    pub cleanup_interval: f64,
    /// Terminal commands older than this many hours are swept
    pub command_retention_hours: f64,
    /// Journal rows kept by the retention sweep
    pub cycle_keep_count: usize,
    /// Cap on a monitor-requested pause
    pub max_intervention_wait: f64,
    /// Install SIGINT/SIGTERM handlers
    pub signal_handlers: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            personality: String::new(),
            goal: String::new(),
            heartbeat_interval: 10.0,
            command_poll_interval: 1.0,
            rest_time: 5.0,
            idle_sleep: 1.0,
            cleanup_interval: 3600.0,
            command_retention_hours: 24.0,
            cycle_keep_count: statestore::MAX_CYCLES_TO_KEEP,
            max_intervention_wait: 60.0,
            signal_handlers: true,
        }
    }
}

/// The standalone worker process
///
/// Lifecycle: the process starts with status `stopped` and waits for
/// commands. `start` begins cycles, `pause`/`resume` gate them, `stop` halts
/// them without exiting, and `shutdown` ends the process loop.
pub struct AgentRunner {
    state: StateStore,
    commands: CommandQueue,
    journal: CycleJournal,
    monitor: MetacognitiveMonitor,
    learning: AdaptiveLearningModule,
    planner: Arc<dyn Planner>,
    executor: Arc<dyn ActionExecutor>,
    config: WorkerConfig,

    agent_state: std::sync::Mutex<String>,
    recent_actions: std::sync::Mutex<Vec<String>>,
    started: AtomicBool,
    paused: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl AgentRunner {
    pub fn new(
        state: StateStore,
        commands: CommandQueue,
        journal: CycleJournal,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn ActionExecutor>,
        config: WorkerConfig,
    ) -> Self {
        let learning = AdaptiveLearningModule::default();
        learning.set_known_actions(&executor.available_actions());
        let monitor = MetacognitiveMonitor::new(
            Some(learning.tracker().clone()),
            true,
            HandoffChannel::Console,
        );

        info!("AgentRunner initialized");
        Self {
            state,
            commands,
            journal,
            monitor,
            learning,
            planner,
            executor,
            config,
            agent_state: std::sync::Mutex::new("idle".to_string()),
            recent_actions: std::sync::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked each iteration; setting it ends the run loop
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop; returns when shutdown is requested
    ///
    /// A fatal error escaping the loop is recorded in shared state before it
    /// propagates to the caller.
    pub async fn run(&self) -> eyre::Result<()> {
        self.initialize()?;

        let result = self.run_loop().await;
        match &result {
            Ok(()) => self.state.set_stopped(None)?,
            Err(e) => {
                error!(error = %e, "Fatal error in agent runner");
                self.state.set_stopped(Some(&e.to_string()))?;
            }
        }
        info!("Agent runner shutdown complete");
        result
    }

    async fn run_loop(&self) -> eyre::Result<()> {
        // None = due immediately on the first iteration
        let mut last_heartbeat: Option<Instant> = None;
        let mut last_poll: Option<Instant> = None;
        let mut last_cleanup = Instant::now();

        loop {
            let heartbeat_due = last_heartbeat
                .is_none_or(|at| at.elapsed().as_secs_f64() >= self.config.heartbeat_interval);
            if heartbeat_due {
                self.state.heartbeat()?;
                last_heartbeat = Some(Instant::now());
            }

            let poll_due = last_poll
                .is_none_or(|at| at.elapsed().as_secs_f64() >= self.config.command_poll_interval);
            if poll_due {
                if let Err(e) = self.process_commands().await {
                    error!(error = %e, "Command processing error");
                }
                last_poll = Some(Instant::now());
            }

            if last_cleanup.elapsed().as_secs_f64() >= self.config.cleanup_interval {
                self.housekeeping();
                last_cleanup = Instant::now();
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }

            if !self.started.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs_f64(self.config.idle_sleep)).await;
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Error in cycle");
            }

            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            debug!("Resting between cycles");
            tokio::time::sleep(Duration::from_secs_f64(self.config.rest_time)).await;
        }
    }

    fn initialize(&self) -> eyre::Result<()> {
        info!("Initializing agent runner (waiting for start command)...");

        self.state.update_state(|state| {
            state.pid = Some(std::process::id());
            state.status = AgentStatus::Stopped;
            state.personality = self.config.personality.clone();
            state.goal = self.config.goal.clone();
        })?;
        self.state.update_mcp_status(false, 0, 0)?;

        if self.config.signal_handlers {
            self.install_signal_handlers();
        }

        info!("Agent runner initialized - waiting for start command");
        Ok(())
    }

    #[cfg(unix)]
    fn install_signal_handlers(&self) {
        use tokio::signal::unix::{SignalKind, signal};
        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            match signal(kind) {
                Ok(mut stream) => {
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received signal, requesting shutdown...");
                        shutdown.store(true, Ordering::SeqCst);
                    });
                }
                Err(e) => warn!(error = %e, "Failed to install signal handler"),
            }
        }
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) {}

    // === Commands ===

    async fn process_commands(&self) -> eyre::Result<()> {
        let Some(command) = self.commands.get_next_command()? else {
            return Ok(());
        };
        info!(command_id = %command.command_id, command_type = ?command.command_type, "Processing command");

        self.commands.mark_processing(&command.command_id)?;

        match self.handle_command(command.command_type, command.params.as_ref()).await {
            Ok(result) => {
                self.commands.mark_completed(&command.command_id, Some(result))?;
            }
            Err(e) => {
                error!(error = %e, "Command failed");
                self.commands.mark_failed(&command.command_id, &e.to_string())?;
            }
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        command_type: CommandType,
        params: Option<&BTreeMap<String, Value>>,
    ) -> eyre::Result<BTreeMap<String, Value>> {
        let mut result = BTreeMap::new();
        match command_type {
            CommandType::Start => {
                if self.started.load(Ordering::SeqCst) {
                    result.insert("status".into(), Value::from("already_running"));
                } else {
                    self.start_cycles()?;
                    result.insert("status".into(), Value::from("started"));
                }
            }
            CommandType::Stop => {
                if !self.started.load(Ordering::SeqCst) {
                    result.insert("status".into(), Value::from("already_stopped"));
                } else {
                    self.stop_cycles()?;
                    result.insert("status".into(), Value::from("stopped"));
                }
            }
            CommandType::Pause => {
                if !self.started.load(Ordering::SeqCst) {
                    result.insert("status".into(), Value::from("error"));
                    result.insert("error".into(), Value::from("Agent not running"));
                } else {
                    self.paused.store(true, Ordering::SeqCst);
                    self.state.update_state(|s| s.status = AgentStatus::Paused)?;
                    result.insert("status".into(), Value::from("paused"));
                }
            }
            CommandType::Resume => {
                if !self.started.load(Ordering::SeqCst) {
                    result.insert("status".into(), Value::from("error"));
                    result.insert("error".into(), Value::from("Agent not running"));
                } else {
                    self.paused.store(false, Ordering::SeqCst);
                    self.state.update_state(|s| s.status = AgentStatus::Running)?;
                    result.insert("status".into(), Value::from("resumed"));
                }
            }
            CommandType::Shutdown => {
                self.shutdown.store(true, Ordering::SeqCst);
                result.insert("status".into(), Value::from("shutdown_requested"));
            }
            CommandType::ExecuteAction => {
                let action = params
                    .and_then(|p| p.get("action"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let Some(action) = action else {
                    result.insert("success".into(), Value::from(false));
                    result.insert("error".into(), Value::from("No action specified"));
                    return Ok(result);
                };
                if !self.executor.available_actions().contains(&action) {
                    result.insert("success".into(), Value::from(false));
                    result.insert("error".into(), Value::from(format!("Unknown action: {action}")));
                    return Ok(result);
                }
                let outcome = self.executor.execute(&action, &BTreeMap::new()).await?;
                result.insert("success".into(), Value::from(outcome.success));
                result.insert("action".into(), Value::from(action));
                result.insert(
                    "outcome".into(),
                    outcome.outcome.map_or(Value::Null, Value::from),
                );
            }
            CommandType::ReloadConfig => {
                // Configuration rereads are wired by the embedding binary
                result.insert("status".into(), Value::from("config_reloaded"));
            }
        }
        Ok(result)
    }

    fn start_cycles(&self) -> eyre::Result<()> {
        info!("Starting agent cycles...");
        self.state.set_running(
            std::process::id(),
            &self.config.personality,
            &self.config.goal,
        )?;
        self.started.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop_cycles(&self) -> eyre::Result<()> {
        info!("Stopping agent cycles...");
        self.started.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.state.update_state(|s| s.status = AgentStatus::Stopped)?;
        Ok(())
    }

    // === Cycle ===

    /// Run one plan / act / learn cycle
    pub async fn run_cycle(&self) -> eyre::Result<bool> {
        let cycle_start = Instant::now();
        let current_state = self.agent_state.lock().expect("agent state poisoned").clone();
        let recent: Vec<String> = {
            let actions = self.recent_actions.lock().expect("recent actions poisoned");
            actions.iter().rev().take(5).rev().cloned().collect()
        };

        self.state.update_state(|s| s.agent_state = current_state.clone())?;

        let available = self.executor.available_actions();
        let mut context = BTreeMap::new();
        context.insert("goal".to_string(), Value::from(self.config.goal.clone()));
        context.insert("state".to_string(), Value::from(current_state.clone()));
        if let Some(previous) = recent.last() {
            context.insert("previous_action".to_string(), Value::from(previous.clone()));
        }

        // 1. Plan
        let planning_start = Instant::now();
        let biases = self.learning.get_action_biases(&context, Some(&available));
        let planned = match self.planner.plan(&current_state, &recent, &biases).await {
            Ok(planned) => planned,
            Err(e) => {
                // Collaborator failure still produces a journal row
                let mut cycle = CycleLog::new(&current_state, recent, "unknown", None);
                cycle.execution_success = false;
                cycle.execution_error = Some(e.to_string());
                cycle.reward = -0.5;
                cycle.total_duration_ms = cycle_start.elapsed().as_millis() as u64;
                cycle.agent_state_after = current_state.clone();
                self.journal.log_cycle(&cycle);
                self.state
                    .update_cycle_info("unknown", &current_state, false, -0.5)?;
                return Err(e);
            }
        };
        let planning_duration = planning_start.elapsed().as_millis() as u64;
        let mut action = planned.action.clone();
        info!(action = %action, "Action chosen");

        // 2. Intervention check
        let intervention = self.monitor.monitor(
            &action,
            &context,
            &MonitorInputs {
                goal: Some(&self.config.goal),
                plan: None,
                available_actions: Some(&available),
            },
        );
        if let Some(chosen) = self.apply_intervention(&intervention, &action, &recent, &biases).await? {
            action = chosen;
        } else {
            // Intervention short-circuited the cycle
            return Ok(false);
        }

        self.state.set_current_action(&action)?;

        let mut cycle = CycleLog::new(&current_state, recent, &action, planned.reasoning.clone());
        cycle.planning_duration_ms = planning_duration;

        // 3. Execute
        let exec_start = Instant::now();
        let (success, outcome_text, reward, next_state, error_text) =
            match self.executor.execute(&action, &BTreeMap::new()).await {
                Ok(outcome) => {
                    let reward = outcome
                        .reward
                        .unwrap_or(if outcome.success { 0.5 } else { -0.5 });
                    let error = (!outcome.success).then(|| {
                        outcome
                            .outcome
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string())
                    });
                    (outcome.success, outcome.outcome, reward, outcome.next_state, error)
                }
                Err(e) => (false, None, -0.5, None, Some(e.to_string())),
            };
        cycle.execution_duration_ms = exec_start.elapsed().as_millis() as u64;
        cycle.execution_success = success;
        cycle.execution_error = error_text.clone();
        if let Some(outcome) = &outcome_text {
            cycle
                .execution_result
                .insert("outcome".to_string(), Value::from(outcome.clone()));
        }
        info!(success, outcome = ?outcome_text, "Execution result");

        // 4. Learn
        let learning = self
            .learning
            .learn_from_outcome(
                &action,
                &context,
                outcome_text.as_deref(),
                reward,
                error_text.as_deref(),
            )
            .await;
        self.monitor
            .record_action_result(&action, success, error_text.as_deref());
        cycle.reward = reward;
        cycle.critique = learning.critique.as_ref().map(|c| c.failure_reason.clone());
        cycle.lesson_learned = learning.lesson_created.as_ref().map(|l| l.summary.clone());

        // 5. Transition agent state and remember the action
        let state_after = next_state.unwrap_or_else(|| current_state.clone());
        *self.agent_state.lock().expect("agent state poisoned") = state_after.clone();
        {
            let mut actions = self.recent_actions.lock().expect("recent actions poisoned");
            actions.push(action.clone());
            if actions.len() > 50 {
                actions.remove(0);
            }
        }
        cycle.agent_state_after = state_after.clone();
        cycle.total_duration_ms = cycle_start.elapsed().as_millis() as u64;

        // 6. Journal and publish
        self.journal.log_cycle(&cycle);
        self.state.add_cycle(CycleInfo {
            cycle_id: cycle.cycle_id.clone(),
            timestamp: cycle.timestamp,
            action: action.clone(),
            state_before: current_state,
            state_after,
            success,
            outcome: outcome_text,
            reward,
            duration_ms: cycle.total_duration_ms,
            error: error_text,
        })?;
        self.state
            .update_cycle_info(&action, &cycle.agent_state_after, success, reward)?;

        Ok(success)
    }

    /// Apply a monitor intervention; returns the action to execute, or
    /// `None` when the cycle should be skipped
    async fn apply_intervention(
        &self,
        intervention: &Intervention,
        action: &str,
        recent: &[String],
        biases: &BTreeMap<String, crate::learning::ActionBias>,
    ) -> eyre::Result<Option<String>> {
        match intervention.intervention_type {
            InterventionType::Continue => Ok(Some(action.to_string())),
            InterventionType::BreakLoop | InterventionType::Fallback => {
                let chosen = intervention
                    .suggested_action
                    .clone()
                    .unwrap_or_else(|| action.to_string());
                warn!(from = action, to = %chosen, reason = %intervention.reason, "Swapping action");
                Ok(Some(chosen))
            }
            InterventionType::Pause | InterventionType::Throttle => {
                let wait = intervention
                    .wait_seconds
                    .min(self.config.max_intervention_wait);
                warn!(wait, reason = %intervention.reason, "Pausing before action");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                Ok(Some(action.to_string()))
            }
            InterventionType::PreemptiveReplan => {
                warn!(reason = %intervention.reason, "Replanning before predicted failure");
                let current_state =
                    self.agent_state.lock().expect("agent state poisoned").clone();
                let replanned = self.planner.plan(&current_state, recent, biases).await?;
                Ok(Some(replanned.action))
            }
            InterventionType::HumanHandoff => {
                warn!(reason = %intervention.reason, "Handoff requested; skipping cycle");
                Ok(None)
            }
            InterventionType::Abort => {
                error!(reason = %intervention.reason, "Monitor aborted; stopping cycles");
                self.started.store(false, Ordering::SeqCst);
                self.paused.store(false, Ordering::SeqCst);
                self.state.set_stopped(Some(&intervention.reason))?;
                Ok(None)
            }
        }
    }

    fn housekeeping(&self) {
        if let Err(e) = self
            .commands
            .cleanup_old_commands(self.config.command_retention_hours)
        {
            warn!(error = %e, "Command cleanup failed");
        }
        if let Err(e) = self.journal.cleanup_old_cycles(self.config.cycle_keep_count) {
            warn!(error = %e, "Cycle cleanup failed");
        }
    }

    /// The metacognitive monitor
    pub fn monitor(&self) -> &MetacognitiveMonitor {
        &self.monitor
    }

    /// The learning module
    pub fn learning(&self) -> &AdaptiveLearningModule {
        &self.learning
    }

    /// Whether cycles are currently started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statestore::CycleFilter;
    use tempfile::TempDir;

    fn runner(dir: &TempDir, failing: bool) -> AgentRunner {
        let root = dir.path();
        let executor = ScriptedExecutor::new(vec!["observe".to_string(), "post".to_string()]);
        let executor = if failing {
            executor.failing_action("post")
        } else {
            executor
        };
        AgentRunner::new(
            StateStore::new(root.join("state")).unwrap(),
            CommandQueue::new(root.join("commands")).unwrap(),
            CycleJournal::open(root.join("cycles.db")).unwrap(),
            Arc::new(ScriptedPlanner::new(vec![
                "observe".to_string(),
                "post".to_string(),
            ])),
            Arc::new(executor),
            WorkerConfig {
                goal: "watch the world and report".to_string(),
                signal_handlers: false,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_run_cycle_journals_and_updates_state() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, false);

        assert!(runner.run_cycle().await.unwrap());

        let state = runner.state.get_state().unwrap();
        assert_eq!(state.cycle_count, 1);
        assert_eq!(state.successful_actions, 1);
        assert_eq!(state.failed_actions, 0);
        assert!(state.current_action.is_none());
        assert!(state.last_action_time.is_some());

        let rows = runner
            .journal
            .get_recent_cycles(10, 0, &CycleFilter::default())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_name, "observe");
        assert!(rows[0].execution_success);
        assert!(rows[0].planning_output_reasoning.is_some());

        let ring = runner.state.get_recent_cycles().unwrap();
        assert_eq!(ring.cycles.len(), 1);
        assert_eq!(ring.cycles[0].action, "observe");
    }

    #[tokio::test]
    async fn test_failed_cycle_counts_failure_and_learns() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, true);

        // First cycle: observe (success); second: post (fails)
        runner.run_cycle().await.unwrap();
        let ok = runner.run_cycle().await.unwrap();
        assert!(!ok);

        let state = runner.state.get_state().unwrap();
        assert_eq!(state.cycle_count, 2);
        assert_eq!(state.successful_actions, 1);
        assert_eq!(state.failed_actions, 1);

        let rows = runner
            .journal
            .get_recent_cycles(
                10,
                0,
                &CycleFilter {
                    success: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_name, "post");
        assert!(rows[0].execution_error.is_some());
        // Timeout failure text produces a rule-based critique
        assert!(rows[0].critique.is_some());

        assert!(runner.learning.get_success_rate("post") < 0.5);
    }

    #[tokio::test]
    async fn test_command_handlers_lifecycle() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, false);
        runner.initialize().unwrap();

        // Pause before start fails politely
        let result = runner.handle_command(CommandType::Pause, None).await.unwrap();
        assert_eq!(result["status"], Value::from("error"));
        assert_eq!(result["error"], Value::from("Agent not running"));

        let result = runner.handle_command(CommandType::Start, None).await.unwrap();
        assert_eq!(result["status"], Value::from("started"));
        assert!(runner.is_started());
        assert_eq!(
            runner.state.get_state().unwrap().status,
            AgentStatus::Running
        );

        let result = runner.handle_command(CommandType::Start, None).await.unwrap();
        assert_eq!(result["status"], Value::from("already_running"));

        let result = runner.handle_command(CommandType::Pause, None).await.unwrap();
        assert_eq!(result["status"], Value::from("paused"));
        assert_eq!(runner.state.get_state().unwrap().status, AgentStatus::Paused);
        assert!(runner.state.get_state().unwrap().is_running);

        let result = runner.handle_command(CommandType::Resume, None).await.unwrap();
        assert_eq!(result["status"], Value::from("resumed"));

        let result = runner.handle_command(CommandType::Stop, None).await.unwrap();
        assert_eq!(result["status"], Value::from("stopped"));
        assert_eq!(
            runner.state.get_state().unwrap().status,
            AgentStatus::Stopped
        );

        let result = runner.handle_command(CommandType::Stop, None).await.unwrap();
        assert_eq!(result["status"], Value::from("already_stopped"));

        let result = runner
            .handle_command(CommandType::Shutdown, None)
            .await
            .unwrap();
        assert_eq!(result["status"], Value::from("shutdown_requested"));
        assert!(runner.shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_execute_action_command() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, false);

        let mut params = BTreeMap::new();
        params.insert("action".to_string(), Value::from("observe"));
        let result = runner
            .handle_command(CommandType::ExecuteAction, Some(&params))
            .await
            .unwrap();
        assert_eq!(result["success"], Value::from(true));
        assert_eq!(result["action"], Value::from("observe"));
        assert_eq!(result["outcome"], Value::from("observe done"));

        let mut params = BTreeMap::new();
        params.insert("action".to_string(), Value::from("fly"));
        let result = runner
            .handle_command(CommandType::ExecuteAction, Some(&params))
            .await
            .unwrap();
        assert_eq!(result["success"], Value::from(false));
        assert_eq!(result["error"], Value::from("Unknown action: fly"));

        let result = runner
            .handle_command(CommandType::ExecuteAction, None)
            .await
            .unwrap();
        assert_eq!(result["error"], Value::from("No action specified"));
    }

    #[tokio::test]
    async fn test_reload_config_placeholder() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, false);
        let result = runner
            .handle_command(CommandType::ReloadConfig, None)
            .await
            .unwrap();
        assert_eq!(result["status"], Value::from("config_reloaded"));
    }

    #[tokio::test]
    async fn test_process_commands_via_queue() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, false);
        runner.initialize().unwrap();

        let sent = runner
            .commands
            .send_command(CommandType::Start, None, 60.0)
            .unwrap();
        runner.process_commands().await.unwrap();

        let done = runner.commands.get_command_status(&sent.command_id).unwrap();
        assert_eq!(done.status, statestore::CommandStatus::Completed);
        assert_eq!(
            done.result.unwrap()["status"],
            Value::from("started")
        );
        assert!(runner.is_started());
    }

    #[tokio::test]
    async fn test_planner_failure_still_journals() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let runner = AgentRunner::new(
            StateStore::new(root.join("state")).unwrap(),
            CommandQueue::new(root.join("commands")).unwrap(),
            CycleJournal::open(root.join("cycles.db")).unwrap(),
            Arc::new(ScriptedPlanner::new(vec![])),
            Arc::new(ScriptedExecutor::new(vec!["observe".to_string()])),
            WorkerConfig {
                signal_handlers: false,
                ..Default::default()
            },
        );

        assert!(runner.run_cycle().await.is_err());

        let rows = runner
            .journal
            .get_recent_cycles(10, 0, &CycleFilter::default())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].execution_success);
        assert!(rows[0].execution_error.is_some());

        let state = runner.state.get_state().unwrap();
        assert_eq!(state.cycle_count, 1);
        assert_eq!(state.failed_actions, 1);
    }
}
