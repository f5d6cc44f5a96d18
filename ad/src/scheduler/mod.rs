//! Task scheduler - emits schedule-trigger events when tasks come due
//!
//! The scheduler owns a map of [`ScheduledTask`]s and runs a cooperative loop
//! that checks for due tasks every `check_interval` seconds, pushing a
//! [`EventType::Schedule`] event for each onto the bound queue.

mod patterns;
mod task;

pub use patterns::PatternLearner;
pub use task::{Recurrence, ScheduledTask};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventPriority, EventQueue};

/// When a scheduled task should first fire
#[derive(Debug, Clone, Copy)]
pub enum When {
    /// At an absolute time
    At(DateTime<Utc>),
    /// After a delay in seconds
    After(f64),
}

impl When {
    fn resolve(self) -> DateTime<Utc> {
        match self {
            When::At(at) => at,
            When::After(secs) => {
                Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64)
            }
        }
    }
}

/// Optional knobs for [`Scheduler::schedule`]
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub payload: Value,
    pub recurrence: Recurrence,
    /// Seconds; required for [`Recurrence::Custom`]
    pub custom_interval: Option<f64>,
    pub priority: EventPriority,
    pub max_runs: Option<u32>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            payload: Value::Object(serde_json::Map::new()),
            recurrence: Recurrence::Once,
            custom_interval: None,
            priority: EventPriority::Low,
            max_runs: None,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatistics {
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub tasks_executed: u64,
    pub tasks_skipped: u64,
    pub next_task_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    executed: u64,
    skipped: u64,
}

/// Emits schedule-trigger events for due tasks
pub struct Scheduler {
    queue: Arc<EventQueue>,
    check_interval: f64,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    counters: Mutex<Counters>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler bound to `queue`, checking for due tasks every
    /// `check_interval` seconds
    pub fn new(queue: Arc<EventQueue>, check_interval: f64) -> Self {
        Self {
            queue,
            check_interval,
            tasks: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Schedule a task
    pub fn schedule(&self, name: &str, when: When, options: TaskOptions) -> ScheduledTask {
        let mut task = ScheduledTask::new(name, when.resolve(), options.recurrence);
        task.payload = options.payload;
        task.custom_interval = options.custom_interval;
        task.priority = options.priority;
        task.max_runs = options.max_runs;

        if task.recurrence == Recurrence::Custom && task.custom_interval.is_none() {
            warn!(name, "Custom recurrence scheduled without an interval; task will fire once");
        }

        info!(name, next_run = %task.next_run, "Scheduled task");
        self.tasks
            .lock()
            .expect("task map poisoned")
            .insert(task.task_id.clone(), task.clone());
        task
    }

    /// Schedule a recurring task at a fixed interval in seconds
    pub fn schedule_recurring(
        &self,
        name: &str,
        interval: f64,
        payload: Value,
        priority: EventPriority,
        start_immediately: bool,
    ) -> ScheduledTask {
        let when = if start_immediately {
            When::After(0.0)
        } else {
            When::After(interval)
        };
        self.schedule(
            name,
            when,
            TaskOptions {
                payload,
                recurrence: Recurrence::Custom,
                custom_interval: Some(interval),
                priority,
                max_runs: None,
            },
        )
    }

    /// Remove a task; returns whether it existed
    pub fn unschedule(&self, task_id: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .expect("task map poisoned")
            .remove(task_id)
            .is_some();
        if removed {
            info!(task_id, "Unscheduled task");
        }
        removed
    }

    /// Enable a task
    pub fn enable(&self, task_id: &str) -> bool {
        self.set_enabled(task_id, true)
    }

    /// Disable a task
    pub fn disable(&self, task_id: &str) -> bool {
        self.set_enabled(task_id, false)
    }

    fn set_enabled(&self, task_id: &str, enabled: bool) -> bool {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        match tasks.get_mut(task_id) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Get a task by id
    pub fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        self.tasks
            .lock()
            .expect("task map poisoned")
            .get(task_id)
            .cloned()
    }

    /// List tasks sorted by `next_run`
    pub fn list_tasks(&self, enabled_only: bool, due_only: bool) -> Vec<ScheduledTask> {
        let tasks = self.tasks.lock().expect("task map poisoned");
        let mut list: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| !enabled_only || t.enabled)
            .filter(|t| !due_only || t.is_due())
            .cloned()
            .collect();
        list.sort_by_key(|t| t.next_run);
        list
    }

    /// Remove all tasks, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("task map poisoned");
        let count = tasks.len();
        tasks.clear();
        info!(count, "Cleared scheduled tasks");
        count
    }

    /// Start the scheduler loop
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            debug!("Scheduler loop started");
            while scheduler.running.load(Ordering::SeqCst) {
                scheduler.check_due_tasks();
                tokio::time::sleep(Duration::from_secs_f64(scheduler.check_interval)).await;
            }
            debug!("Scheduler loop ended");
        });
        *self.handle.lock().expect("handle poisoned") = Some(handle);
        info!("Scheduler started");
    }

    /// Stop the scheduler loop; cancellation lands at the sleep boundary
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().expect("handle poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    /// Whether the scheduler loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One pass over due tasks: emit their events, mark runs, and drop
    /// exhausted tasks. Enqueue failures count as skips and never crash the
    /// loop.
    pub fn check_due_tasks(&self) {
        let due = self.list_tasks(false, true);

        for task in due {
            let mut event = Event::scheduled(&task.task_id, &task.name, task.payload.clone());
            event.priority = task.priority;

            match self.queue.put_nowait(event) {
                Ok(()) => {
                    self.counters.lock().expect("counters poisoned").executed += 1;
                    debug!(name = %task.name, "Task triggered");
                }
                Err(e) => {
                    self.counters.lock().expect("counters poisoned").skipped += 1;
                    error!(name = %task.name, error = %e, "Failed to enqueue task event");
                    continue;
                }
            }

            let mut tasks = self.tasks.lock().expect("task map poisoned");
            if let Some(stored) = tasks.get_mut(&task.task_id) {
                stored.mark_run();
                if stored.is_exhausted() {
                    tasks.remove(&task.task_id);
                    debug!(name = %task.name, "Task exhausted and removed");
                }
            }
        }
    }

    /// Snapshot of scheduler statistics
    pub fn get_statistics(&self) -> SchedulerStatistics {
        let counters = self.counters.lock().expect("counters poisoned");
        let upcoming = self.list_tasks(true, false);
        SchedulerStatistics {
            total_tasks: self.tasks.lock().expect("task map poisoned").len(),
            enabled_tasks: upcoming.len(),
            tasks_executed: counters.executed,
            tasks_skipped: counters.skipped,
            next_task_at: upcoming.first().map(|t| t.next_run),
        }
    }
}
