//! Background process supervisor
//!
//! Named periodic tasks with error thresholds. Each process runs its own
//! cooperative loop: optional immediate run, then sleep / invoke. A process
//! that fails `max_errors` consecutive times transitions to `Error` and exits
//! its loop; the supervisor keeps running.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State of a background process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Statistics for a background process
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStatistics {
    pub iterations: u64,
    pub errors: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub total_run_time: f64,
}

/// Snapshot of a background process definition and its current state
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundProcess {
    pub name: String,
    /// Seconds between runs
    pub interval: f64,
    pub enabled: bool,
    pub state: ProcessState,
    pub statistics: ProcessStatistics,
    pub run_on_start: bool,
    /// Max consecutive errors before the process stops itself
    pub max_errors: u32,
    pub consecutive_errors: u32,
}

/// The async function a background process runs each interval
pub type ProcessFn = Arc<dyn Fn() -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

struct ProcessEntry {
    func: ProcessFn,
    info: Mutex<BackgroundProcess>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessEntry {
    fn snapshot(&self) -> BackgroundProcess {
        self.info.lock().expect("process info poisoned").clone()
    }
}

/// Manages long-running periodic tasks (health checks, consolidation,
/// learning updates)
#[derive(Default)]
pub struct BackgroundProcessManager {
    processes: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    running: Arc<AtomicBool>,
}

impl BackgroundProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process; does not start it
    pub fn register<F, Fut>(
        &self,
        name: &str,
        func: F,
        interval: f64,
        enabled: bool,
        run_on_start: bool,
        max_errors: u32,
    ) -> BackgroundProcess
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = eyre::Result<()>> + Send + 'static,
    {
        use futures::FutureExt;
        let entry = Arc::new(ProcessEntry {
            func: Arc::new(move || func().boxed()),
            info: Mutex::new(BackgroundProcess {
                name: name.to_string(),
                interval,
                enabled,
                state: ProcessState::Stopped,
                statistics: ProcessStatistics::default(),
                run_on_start,
                max_errors,
                consecutive_errors: 0,
            }),
            handle: Mutex::new(None),
        });
        let snapshot = entry.snapshot();
        self.processes
            .lock()
            .expect("process map poisoned")
            .insert(name.to_string(), entry);
        debug!(name, interval, "Registered background process");
        snapshot
    }

    /// Remove a process, stopping it first if running
    pub async fn unregister(&self, name: &str) -> bool {
        let entry = self.processes.lock().expect("process map poisoned").remove(name);
        match entry {
            Some(entry) => {
                Self::stop_entry(&entry).await;
                true
            }
            None => false,
        }
    }

    /// Enable a process
    pub fn enable(&self, name: &str) -> bool {
        let processes = self.processes.lock().expect("process map poisoned");
        match processes.get(name) {
            Some(entry) => {
                entry.info.lock().expect("process info poisoned").enabled = true;
                true
            }
            None => false,
        }
    }

    /// Disable a process, stopping it if running
    pub async fn disable(&self, name: &str) -> bool {
        let entry = {
            let processes = self.processes.lock().expect("process map poisoned");
            processes.get(name).cloned()
        };
        match entry {
            Some(entry) => {
                entry.info.lock().expect("process info poisoned").enabled = false;
                Self::stop_entry(&entry).await;
                true
            }
            None => false,
        }
    }

    /// Start all enabled processes
    pub async fn start_all(&self) {
        self.running.store(true, Ordering::SeqCst);
        let entries: Vec<Arc<ProcessEntry>> = self
            .processes
            .lock()
            .expect("process map poisoned")
            .values()
            .cloned()
            .collect();
        let mut started = 0;
        for entry in entries {
            if entry.info.lock().expect("process info poisoned").enabled {
                self.start_entry(entry);
                started += 1;
            }
        }
        info!(started, "Started background processes");
    }

    /// Stop all running processes
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        let entries: Vec<Arc<ProcessEntry>> = self
            .processes
            .lock()
            .expect("process map poisoned")
            .values()
            .cloned()
            .collect();
        for entry in entries {
            Self::stop_entry(&entry).await;
        }
        info!("Stopped all background processes");
    }

    /// Start one process by name
    pub async fn start(&self, name: &str) -> bool {
        let entry = {
            let processes = self.processes.lock().expect("process map poisoned");
            processes.get(name).cloned()
        };
        let Some(entry) = entry else {
            return false;
        };
        if entry.info.lock().expect("process info poisoned").state == ProcessState::Running {
            warn!(name, "Process already running");
            return false;
        }
        self.running.store(true, Ordering::SeqCst);
        self.start_entry(entry);
        true
    }

    /// Stop one process by name
    pub async fn stop(&self, name: &str) -> bool {
        let entry = {
            let processes = self.processes.lock().expect("process map poisoned");
            processes.get(name).cloned()
        };
        let Some(entry) = entry else {
            return false;
        };
        if entry.info.lock().expect("process info poisoned").state != ProcessState::Running {
            warn!(name, "Process not running");
            return false;
        }
        Self::stop_entry(&entry).await;
        true
    }

    fn start_entry(&self, entry: Arc<ProcessEntry>) {
        let name = {
            let mut info = entry.info.lock().expect("process info poisoned");
            info.state = ProcessState::Starting;
            info.statistics.started_at = Some(Utc::now());
            info.consecutive_errors = 0;
            info.name.clone()
        };

        let manager_running = self.running.clone();
        let loop_entry = entry.clone();
        let handle = tokio::spawn(async move {
            Self::run_process(loop_entry, manager_running).await;
        });

        let mut info = entry.info.lock().expect("process info poisoned");
        info.state = ProcessState::Running;
        *entry.handle.lock().expect("process handle poisoned") = Some(handle);
        info!(name = %name, "Background process started");
    }

    async fn stop_entry(entry: &Arc<ProcessEntry>) {
        let name = {
            let mut info = entry.info.lock().expect("process info poisoned");
            if info.state != ProcessState::Running && info.state != ProcessState::Error {
                return;
            }
            info.state = ProcessState::Stopping;
            info.name.clone()
        };

        let handle = entry.handle.lock().expect("process handle poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        entry.info.lock().expect("process info poisoned").state = ProcessState::Stopped;
        info!(name = %name, "Background process stopped");
    }

    async fn run_process(entry: Arc<ProcessEntry>, manager_running: Arc<AtomicBool>) {
        let (run_on_start, interval) = {
            let info = entry.info.lock().expect("process info poisoned");
            (info.run_on_start, info.interval)
        };

        if run_on_start && !Self::execute_iteration(&entry).await {
            return;
        }

        loop {
            // Cancellation lands here, at the sleep boundary
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;

            let still_running = entry.info.lock().expect("process info poisoned").state
                == ProcessState::Running
                && manager_running.load(Ordering::SeqCst);
            if !still_running {
                break;
            }

            if !Self::execute_iteration(&entry).await {
                break;
            }
        }
    }

    /// Run one iteration; returns false when the process hit its error
    /// threshold and must exit its loop
    async fn execute_iteration(entry: &Arc<ProcessEntry>) -> bool {
        let func = entry.func.clone();
        let start = Instant::now();
        let result = func().await;
        let elapsed = start.elapsed().as_secs_f64();

        let mut info = entry.info.lock().expect("process info poisoned");
        info.statistics.last_run_at = Some(Utc::now());
        info.statistics.total_run_time += elapsed;

        match result {
            Ok(()) => {
                info.consecutive_errors = 0;
                info.statistics.iterations += 1;
                true
            }
            Err(e) => {
                info.consecutive_errors += 1;
                info.statistics.errors += 1;
                info.statistics.last_error = Some(e.to_string());
                error!(name = %info.name, error = %e, "Error in background process");

                if info.consecutive_errors >= info.max_errors {
                    error!(
                        name = %info.name,
                        max_errors = info.max_errors,
                        "Process exceeded max errors, stopping"
                    );
                    info.state = ProcessState::Error;
                    return false;
                }
                true
            }
        }
    }

    /// Get a snapshot of one process
    pub fn get_process(&self, name: &str) -> Option<BackgroundProcess> {
        self.processes
            .lock()
            .expect("process map poisoned")
            .get(name)
            .map(|entry| entry.snapshot())
    }

    /// List process snapshots
    pub fn list_processes(&self, running_only: bool) -> Vec<BackgroundProcess> {
        self.processes
            .lock()
            .expect("process map poisoned")
            .values()
            .map(|entry| entry.snapshot())
            .filter(|p| !running_only || p.state == ProcessState::Running)
            .collect()
    }

    /// Statistics for all processes keyed by name
    pub fn get_statistics(&self) -> BTreeMap<String, BackgroundProcess> {
        self.processes
            .lock()
            .expect("process map poisoned")
            .iter()
            .map(|(name, entry)| (name.clone(), entry.snapshot()))
            .collect()
    }

    /// Whether the manager has been started
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_run_on_start_invokes_immediately() {
        let manager = BackgroundProcessManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            manager.register(
                "ticker",
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                3600.0,
                true,
                true,
                10,
            );
        }

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let process = manager.get_process("ticker").unwrap();
        assert_eq!(process.state, ProcessState::Running);
        assert_eq!(process.statistics.iterations, 1);

        manager.stop_all().await;
        assert_eq!(manager.get_process("ticker").unwrap().state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_interval_loop_runs_repeatedly() {
        let manager = BackgroundProcessManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            manager.register(
                "fast",
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                0.02,
                true,
                false,
                10,
            );
        }

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop_all().await;

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_error_threshold_transitions_to_error() {
        let manager = BackgroundProcessManager::new();
        manager.register(
            "flaky",
            || async { Err(eyre::eyre!("nope")) },
            0.01,
            true,
            true,
            3,
        );

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let process = manager.get_process("flaky").unwrap();
        assert_eq!(process.state, ProcessState::Error);
        assert_eq!(process.consecutive_errors, 3);
        assert_eq!(process.statistics.errors, 3);
        assert_eq!(process.statistics.last_error.as_deref(), Some("nope"));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_errors() {
        let manager = BackgroundProcessManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            // Fails twice, then succeeds forever
            manager.register(
                "recovers",
                move || {
                    let count = count.clone();
                    async move {
                        if count.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(eyre::eyre!("warming up"))
                        } else {
                            Ok(())
                        }
                    }
                },
                0.01,
                true,
                true,
                3,
            );
        }

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop_all().await;

        let process = manager.get_process("recovers").unwrap();
        assert_eq!(process.consecutive_errors, 0);
        assert_eq!(process.statistics.errors, 2);
        assert!(process.statistics.iterations >= 1);
    }

    #[tokio::test]
    async fn test_disabled_process_not_started() {
        let manager = BackgroundProcessManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            manager.register(
                "off",
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                0.01,
                false,
                true,
                10,
            );
        }

        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop_all().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_individual_start_stop_and_unregister() {
        let manager = BackgroundProcessManager::new();
        manager.register("solo", || async { Ok(()) }, 3600.0, true, false, 10);

        assert!(manager.start("solo").await);
        assert!(!manager.start("solo").await);
        assert_eq!(manager.list_processes(true).len(), 1);

        assert!(manager.stop("solo").await);
        assert!(!manager.stop("solo").await);
        assert!(manager.list_processes(true).is_empty());

        assert!(manager.unregister("solo").await);
        assert!(!manager.unregister("solo").await);
        assert!(manager.get_process("solo").is_none());
    }
}
