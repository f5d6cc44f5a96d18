//! Autonomous runtime - composes queue, dispatcher, scheduler, supervisor,
//! and listeners into one lifecycle
//!
//! The runtime is single-threaded cooperative: one dispatch loop consumes the
//! queue while the scheduler, background processes, and listeners run as
//! cooperating tasks that communicate only through that queue.

mod background;
mod listener;

pub use background::{
    BackgroundProcess, BackgroundProcessManager, ProcessState, ProcessStatistics,
};
pub use listener::{
    CallbackListener, EventCallback, EventListener, ListenerSet, ListenerStats, WebhookListener,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{
    Event, EventPriority, EventProcessor, EventQueue, EventType, ProcessingResult,
    ProcessorStatistics, QueueStatistics,
};
use crate::scheduler::{
    PatternLearner, Recurrence, ScheduledTask, Scheduler, SchedulerStatistics, TaskOptions, When,
};

/// State of the autonomous runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

/// Configuration for the autonomous runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Event queue capacity (0 = unbounded)
    pub queue_maxsize: usize,

    // Webhook settings
    pub webhook_enabled: bool,
    pub webhook_host: String,
    pub webhook_port: u16,
    pub webhook_path: String,
    pub webhook_auth_token: Option<String>,

    // Scheduler settings
    pub scheduler_enabled: bool,
    pub scheduler_check_interval: f64,

    // Background process settings
    pub background_enabled: bool,

    /// Max seconds one event may spend in its handler chain
    pub process_timeout: f64,
    /// Seconds to wait for the main loop before cancelling it on stop
    pub graceful_shutdown_timeout: f64,
    /// Install SIGINT/SIGTERM handlers on start
    pub signal_handlers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: 0,
            webhook_enabled: false,
            webhook_host: "0.0.0.0".to_string(),
            webhook_port: 8080,
            webhook_path: "/webhook".to_string(),
            webhook_auth_token: None,
            scheduler_enabled: true,
            scheduler_check_interval: 10.0,
            background_enabled: true,
            process_timeout: 300.0,
            graceful_shutdown_timeout: 30.0,
            signal_handlers: true,
        }
    }
}

/// Top-level runtime counters
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatistics {
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime_seconds: f64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub current_queue_size: usize,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Aggregated statistics across all runtime components
#[derive(Debug, Clone)]
pub struct RuntimeReport {
    pub state: RuntimeState,
    pub runtime: RuntimeStatistics,
    pub queue: QueueStatistics,
    pub queue_paused: bool,
    pub processor: ProcessorStatistics,
    pub scheduler: SchedulerStatistics,
    pub background: BTreeMap<String, BackgroundProcess>,
    pub listeners: BTreeMap<String, ListenerStats>,
}

/// Event-driven runtime for the autonomous agent
pub struct AutonomousRuntime {
    config: RuntimeConfig,
    state: Mutex<RuntimeState>,
    queue: Arc<EventQueue>,
    processor: Arc<EventProcessor>,
    scheduler: Arc<Scheduler>,
    background: Arc<BackgroundProcessManager>,
    listeners: Arc<ListenerSet>,
    callback_listener: Arc<CallbackListener>,
    webhook_listener: Option<Arc<WebhookListener>>,
    pattern_learner: Arc<PatternLearner>,
    main_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    statistics: Mutex<RuntimeStatistics>,
}

impl AutonomousRuntime {
    /// Build a runtime from configuration; nothing starts until `start`
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let queue = Arc::new(EventQueue::with_maxsize(config.queue_maxsize));
        let processor = Arc::new(EventProcessor::new());
        let scheduler = Arc::new(Scheduler::new(queue.clone(), config.scheduler_check_interval));
        let listeners = Arc::new(ListenerSet::new());

        // Dedicated listener for programmatic emission so emitted events show
        // up in listener statistics
        let callback_listener = Arc::new(CallbackListener::new(queue.clone(), "runtime"));
        listeners.add(callback_listener.clone());

        let webhook_listener = if config.webhook_enabled {
            let webhook = Arc::new(WebhookListener::new(
                queue.clone(),
                &config.webhook_host,
                config.webhook_port,
                &config.webhook_path,
                config.webhook_auth_token.clone(),
            ));
            listeners.add(webhook.clone());
            Some(webhook)
        } else {
            None
        };

        debug!("AutonomousRuntime initialized");
        Arc::new(Self {
            config,
            state: Mutex::new(RuntimeState::Stopped),
            queue,
            processor,
            scheduler,
            background: Arc::new(BackgroundProcessManager::new()),
            listeners,
            callback_listener,
            webhook_listener,
            pattern_learner: Arc::new(PatternLearner::new()),
            main_task: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            statistics: Mutex::new(RuntimeStatistics::default()),
        })
    }

    // === Event handling ===

    /// Register an event handler (runs after any previously registered ones)
    pub fn register_handler(
        &self,
        event_type: EventType,
        handler: Arc<dyn crate::events::EventHandler>,
    ) {
        self.processor.register_handler(event_type, handler);
    }

    /// Set the handler used when no type-specific handler matches
    pub fn set_default_handler(&self, handler: Arc<dyn crate::events::EventHandler>) {
        self.processor.set_default_handler(handler);
    }

    // === Event injection ===

    /// Emit an event through the runtime's callback listener
    pub async fn emit(&self, event: Event) {
        self.callback_listener.inject(event).await;
    }

    /// Emit a message event
    pub async fn emit_message(&self, content: &str, channel: &str, sender: Option<&str>) {
        self.emit(Event::message(content, channel, sender)).await;
    }

    // === Scheduling ===

    /// Schedule a task
    pub fn schedule(&self, name: &str, when: When, options: TaskOptions) -> ScheduledTask {
        self.scheduler.schedule(name, when, options)
    }

    /// Schedule a recurring task
    pub fn schedule_recurring(
        &self,
        name: &str,
        interval_seconds: f64,
        payload: serde_json::Value,
        priority: EventPriority,
        start_immediately: bool,
    ) -> ScheduledTask {
        self.scheduler
            .schedule_recurring(name, interval_seconds, payload, priority, start_immediately)
    }

    /// Propose a schedule for an action from learned timing patterns
    pub fn suggest_schedule(&self, action: &str, recurrence: Recurrence) -> Option<ScheduledTask> {
        self.pattern_learner.suggest_schedule(action, recurrence)
    }

    // === Background processes ===

    /// Register a background process
    pub fn register_background_process<F, Fut>(
        &self,
        name: &str,
        func: F,
        interval: f64,
        run_on_start: bool,
        max_errors: u32,
    ) -> BackgroundProcess
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.background
            .register(name, func, interval, true, run_on_start, max_errors)
    }

    // === Lifecycle ===

    /// Start listeners, scheduler, supervisor, signal handling, and the main
    /// dispatch loop
    pub async fn start(self: &Arc<Self>) -> eyre::Result<()> {
        if self.state() == RuntimeState::Running {
            warn!("Runtime already running");
            return Ok(());
        }

        self.set_state(RuntimeState::Starting);
        self.shutdown.store(false, Ordering::SeqCst);
        self.statistics.lock().expect("statistics poisoned").started_at = Some(Utc::now());

        self.listeners.start_all().await;

        if self.config.scheduler_enabled {
            self.scheduler.start();
        }
        if self.config.background_enabled {
            self.background.start_all().await;
        }
        if self.config.signal_handlers {
            self.install_signal_handlers();
        }

        self.queue
            .put(Event::system(EventType::Startup, EventPriority::Critical))
            .await;

        self.set_state(RuntimeState::Running);
        let runtime = self.clone();
        *self.main_task.lock().expect("main task poisoned") =
            Some(tokio::spawn(async move { runtime.main_loop().await }));

        info!("AutonomousRuntime started");
        Ok(())
    }

    /// Stop the runtime gracefully
    pub async fn stop(&self) {
        let state = self.state();
        if state != RuntimeState::Running && state != RuntimeState::Paused {
            warn!(?state, "Runtime not running");
            return;
        }

        self.set_state(RuntimeState::Stopping);
        info!("Stopping AutonomousRuntime...");

        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock a paused queue so the loop can observe the flag
        self.queue.resume();
        self.queue
            .put(Event::system(EventType::Shutdown, EventPriority::Critical))
            .await;

        let main_task = self.main_task.lock().expect("main task poisoned").take();
        if let Some(task) = main_task {
            let abort = task.abort_handle();
            let timeout = Duration::from_secs_f64(self.config.graceful_shutdown_timeout);
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!("Main loop did not stop gracefully, cancelling");
                abort.abort();
            }
        }

        // Stop components in reverse start order
        self.background.stop_all().await;
        if self.config.scheduler_enabled {
            self.scheduler.stop().await;
        }
        self.listeners.stop_all().await;

        self.set_state(RuntimeState::Stopped);
        {
            let mut stats = self.statistics.lock().expect("statistics poisoned");
            stats.stopped_at = Some(Utc::now());
        }
        info!("AutonomousRuntime stopped");
    }

    /// Pause event dispatch via the queue's pause gate
    pub fn pause(&self) {
        if self.state() != RuntimeState::Running {
            return;
        }
        self.queue.pause();
        self.set_state(RuntimeState::Paused);
        info!("Runtime paused");
    }

    /// Resume event dispatch
    pub fn resume(&self) {
        if self.state() != RuntimeState::Paused {
            return;
        }
        self.queue.resume();
        self.set_state(RuntimeState::Running);
        info!("Runtime resumed");
    }

    // === Main loop ===

    async fn main_loop(self: Arc<Self>) {
        debug!("Main loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let state = self.state();
            if state != RuntimeState::Running && state != RuntimeState::Paused {
                break;
            }

            // Short timeout so the shutdown flag is observed while idle
            let event = match tokio::time::timeout(
                Duration::from_secs(1),
                self.queue.get(true),
            )
            .await
            {
                Ok(event) => event,
                Err(_) => continue,
            };

            let process_timeout = Duration::from_secs_f64(self.config.process_timeout);
            match tokio::time::timeout(process_timeout, self.processor.process(event.clone())).await
            {
                Ok(result) => self.record_event(&result),
                Err(_) => {
                    error!(
                        event_type = event.event_type.as_str(),
                        "Event processing timeout"
                    );
                    let mut stats = self.statistics.lock().expect("statistics poisoned");
                    stats.events_processed += 1;
                    stats.events_failed += 1;
                }
            }
            self.queue.task_done();
        }

        debug!("Main loop ended");
    }

    fn record_event(&self, result: &ProcessingResult) {
        let mut stats = self.statistics.lock().expect("statistics poisoned");
        stats.events_processed += 1;
        stats.last_event_at = Some(Utc::now());
        if !result.success {
            stats.events_failed += 1;
        }
    }

    // === Signal handling ===

    #[cfg(unix)]
    fn install_signal_handlers(self: &Arc<Self>) {
        use tokio::signal::unix::{SignalKind, signal};

        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            match signal(kind) {
                Ok(mut stream) => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received shutdown signal");
                        runtime.stop().await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to install signal handler"),
            }
        }
        debug!("Signal handlers installed");
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(self: &Arc<Self>) {
        debug!("Signal handlers not supported on this platform");
    }

    // === Statistics and accessors ===

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        *self.state.lock().expect("state poisoned")
    }

    fn set_state(&self, state: RuntimeState) {
        *self.state.lock().expect("state poisoned") = state;
    }

    /// Whether the runtime is running (not paused, not stopped)
    pub fn is_running(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    /// Aggregate statistics across queue, processor, scheduler, background
    /// processes, and listeners
    pub fn get_statistics(&self) -> RuntimeReport {
        let mut runtime = self.statistics.lock().expect("statistics poisoned").clone();
        runtime.current_queue_size = self.queue.qsize();
        if let Some(started) = runtime.started_at {
            let end = runtime.stopped_at.unwrap_or_else(Utc::now);
            runtime.uptime_seconds = (end - started).num_milliseconds() as f64 / 1000.0;
        }

        RuntimeReport {
            state: self.state(),
            runtime,
            queue: self.queue.get_statistics(),
            queue_paused: self.queue.is_paused(),
            processor: self.processor.get_statistics(),
            scheduler: self.scheduler.get_statistics(),
            background: self.background.get_statistics(),
            listeners: self.listeners.statistics(),
        }
    }

    /// The shared event queue
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// The event processor
    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The background process manager
    pub fn background(&self) -> &Arc<BackgroundProcessManager> {
        &self.background
    }

    /// The pattern learner feeding `suggest_schedule`
    pub fn pattern_learner(&self) -> &Arc<PatternLearner> {
        &self.pattern_learner
    }

    /// The webhook listener, when enabled
    pub fn webhook_listener(&self) -> Option<&Arc<WebhookListener>> {
        self.webhook_listener.as_ref()
    }
}
