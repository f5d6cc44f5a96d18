//! Shared runtime state for IPC between controller and worker
//!
//! The worker process writes its current state here; the controller reads it
//! without owning the runtime. Both sides serialize access through an advisory
//! exclusive lock on a sentinel file, so readers always see a complete JSON
//! snapshot and writers never interleave.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Lifecycle status of the agent runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

impl AgentStatus {
    /// Whether this status counts as "running" for liveness purposes
    pub fn is_running(self) -> bool {
        matches!(self, AgentStatus::Running | AgentStatus::Paused)
    }
}

/// Current state of the agent runtime, shared between processes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRuntimeState {
    // Process info
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,

    // Runtime state
    pub status: AgentStatus,
    /// Derivable from `status`; persisted so simple readers need no mapping
    pub is_running: bool,

    // Agent state
    pub agent_state: String,
    pub personality: String,
    pub goal: String,

    // MCP status
    pub mcp_enabled: bool,
    pub mcp_connected_servers: u32,
    pub mcp_available_tools: u32,

    // Current cycle info
    pub current_action: Option<String>,
    pub cycle_count: u64,
    pub last_action_time: Option<DateTime<Utc>>,

    // Statistics
    pub total_rewards: f64,
    pub successful_actions: u64,
    pub failed_actions: u64,

    // Error info
    pub last_error: Option<String>,
    pub error_count: u64,
}

/// Information about a single agent cycle, kept in the bounded ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleInfo {
    pub cycle_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub state_before: String,
    pub state_after: String,
    pub success: bool,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub reward: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Bounded ring of recent cycles, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentCycles {
    pub cycles: Vec<CycleInfo>,
    pub max_cycles: usize,
}

impl Default for RecentCycles {
    fn default() -> Self {
        Self {
            cycles: Vec::new(),
            max_cycles: 50,
        }
    }
}

impl RecentCycles {
    /// Add a cycle at the front, dropping the oldest beyond `max_cycles`
    pub fn add_cycle(&mut self, cycle: CycleInfo) {
        self.cycles.insert(0, cycle);
        self.cycles.truncate(self.max_cycles);
    }
}

/// Full status snapshot for the controller
#[derive(Debug, Clone, Serialize)]
pub struct FullStatus {
    pub state: AgentRuntimeState,
    pub is_alive: bool,
    pub is_process_running: bool,
    pub recent_cycles_count: usize,
}

/// Guard holding the advisory exclusive lock; released on drop
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(error = %e, "Failed to release state lock");
        }
    }
}

/// Manages `state.json` and `cycles.json` under an advisory file lock
///
/// Every read and write acquires the lock for the duration of the
/// load → modify → store cycle, so a partial write is never visible to the
/// other process. The lock survives a crash of the holder: the OS releases it
/// when the descriptor closes.
pub struct StateStore {
    state_dir: PathBuf,
    state_file: PathBuf,
    cycles_file: PathBuf,
    lock_file: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) a state store rooted at `state_dir`
    pub fn new(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir)?;

        let store = Self {
            state_file: state_dir.join("state.json"),
            cycles_file: state_dir.join("cycles.json"),
            lock_file: state_dir.join(".lock"),
            state_dir,
        };

        // Seed files so first readers see valid defaults
        {
            let _guard = store.lock()?;
            if !store.state_file.exists() {
                store.write_state_locked(&AgentRuntimeState::default())?;
            }
            if !store.cycles_file.exists() {
                store.write_cycles_locked(&RecentCycles::default())?;
            }
        }

        debug!(state_dir = %store.state_dir.display(), "StateStore initialized");
        Ok(store)
    }

    /// Directory this store is rooted at
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn lock(&self) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_file)?;
        file.lock_exclusive()?;
        Ok(LockGuard { file })
    }

    fn read_state_locked(&self) -> Result<AgentRuntimeState> {
        if !self.state_file.exists() {
            return Ok(AgentRuntimeState::default());
        }
        let raw = fs::read_to_string(&self.state_file)?;
        serde_json::from_str(&raw).map_err(|source| StoreError::StateCorruption {
            path: self.state_file.clone(),
            source,
        })
    }

    fn write_state_locked(&self, state: &AgentRuntimeState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&self.state_file, raw)?;
        Ok(())
    }

    fn read_cycles_locked(&self) -> Result<RecentCycles> {
        if !self.cycles_file.exists() {
            return Ok(RecentCycles::default());
        }
        let raw = fs::read_to_string(&self.cycles_file)?;
        serde_json::from_str(&raw).map_err(|source| StoreError::StateCorruption {
            path: self.cycles_file.clone(),
            source,
        })
    }

    fn write_cycles_locked(&self, cycles: &RecentCycles) -> Result<()> {
        let raw = serde_json::to_string_pretty(cycles)?;
        fs::write(&self.cycles_file, raw)?;
        Ok(())
    }

    // === State operations ===

    /// Get the current runtime state
    pub fn get_state(&self) -> Result<AgentRuntimeState> {
        let _guard = self.lock()?;
        self.read_state_locked()
    }

    /// Get the current state, falling back to defaults on corruption
    ///
    /// Callers recover from a corrupt file by treating the state as empty;
    /// the file itself is left in place unless `clear_state` is invoked.
    pub fn get_state_or_default(&self) -> AgentRuntimeState {
        match self.get_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "State unreadable, using defaults");
                AgentRuntimeState::default()
            }
        }
    }

    /// Apply `mutate` to the current state and persist the result atomically
    /// with respect to other lock holders
    pub fn update_state<F>(&self, mutate: F) -> Result<AgentRuntimeState>
    where
        F: FnOnce(&mut AgentRuntimeState),
    {
        let _guard = self.lock()?;
        let mut state = self.read_state_locked().unwrap_or_default();
        mutate(&mut state);
        // Keep the derived flag consistent with status on every write
        state.is_running = state.status.is_running();
        self.write_state_locked(&state)?;
        Ok(state)
    }

    /// Mark the agent as running
    pub fn set_running(&self, pid: u32, personality: &str, goal: &str) -> Result<()> {
        debug!(pid, "StateStore::set_running");
        let now = Utc::now();
        self.update_state(|state| {
            state.pid = Some(pid);
            state.started_at = Some(now);
            state.last_heartbeat = Some(now);
            state.status = AgentStatus::Running;
            state.personality = personality.to_string();
            state.goal = goal.to_string();
        })?;
        Ok(())
    }

    /// Mark the agent as stopped, optionally recording an error
    pub fn set_stopped(&self, error: Option<&str>) -> Result<()> {
        debug!(?error, "StateStore::set_stopped");
        self.update_state(|state| {
            state.current_action = None;
            match error {
                Some(e) if !e.is_empty() => {
                    state.status = AgentStatus::Error;
                    state.last_error = Some(e.to_string());
                    state.error_count += 1;
                }
                _ => state.status = AgentStatus::Stopped,
            }
        })?;
        Ok(())
    }

    /// Update the heartbeat timestamp
    ///
    /// Never moves the timestamp backwards, even across clock regressions.
    pub fn heartbeat(&self) -> Result<()> {
        let now = Utc::now();
        self.update_state(|state| {
            if state.last_heartbeat.is_none_or(|prev| prev < now) {
                state.last_heartbeat = Some(now);
            }
        })?;
        Ok(())
    }

    /// Update counters after a completed cycle
    pub fn update_cycle_info(
        &self,
        _action: &str,
        agent_state: &str,
        success: bool,
        reward: f64,
    ) -> Result<()> {
        self.update_state(|state| {
            state.current_action = None;
            state.cycle_count += 1;
            state.last_action_time = Some(Utc::now());
            state.agent_state = agent_state.to_string();
            state.total_rewards += reward;
            if success {
                state.successful_actions += 1;
            } else {
                state.failed_actions += 1;
            }
        })?;
        Ok(())
    }

    /// Record the action currently being executed
    pub fn set_current_action(&self, action: &str) -> Result<()> {
        self.update_state(|state| state.current_action = Some(action.to_string()))?;
        Ok(())
    }

    /// Update MCP connection status
    pub fn update_mcp_status(
        &self,
        enabled: bool,
        connected_servers: u32,
        available_tools: u32,
    ) -> Result<()> {
        self.update_state(|state| {
            state.mcp_enabled = enabled;
            state.mcp_connected_servers = connected_servers;
            state.mcp_available_tools = available_tools;
        })?;
        Ok(())
    }

    // === Cycle ring operations ===

    /// Get the recent cycle ring
    pub fn get_recent_cycles(&self) -> Result<RecentCycles> {
        let _guard = self.lock()?;
        self.read_cycles_locked()
    }

    /// Append a cycle to the ring, dropping the oldest beyond the cap
    pub fn add_cycle(&self, cycle: CycleInfo) -> Result<()> {
        let _guard = self.lock()?;
        let mut cycles = self.read_cycles_locked().unwrap_or_default();
        cycles.add_cycle(cycle);
        self.write_cycles_locked(&cycles)
    }

    // === Liveness ===

    /// Whether the agent appears alive based on its heartbeat
    ///
    /// A corrupt state file or a malformed heartbeat yields `false`.
    pub fn is_agent_alive(&self, timeout_seconds: f64) -> bool {
        let state = match self.get_state() {
            Ok(s) => s,
            Err(_) => return false,
        };
        if !state.is_running {
            return false;
        }
        let Some(last_beat) = state.last_heartbeat else {
            return false;
        };
        let age = (Utc::now() - last_beat).num_milliseconds() as f64 / 1000.0;
        age < timeout_seconds
    }

    /// Whether the recorded pid refers to a live OS process
    pub fn is_agent_process_running(&self) -> bool {
        let Ok(state) = self.get_state() else {
            return false;
        };
        let Some(pid) = state.pid else {
            return false;
        };
        // Signal 0 probes existence without affecting the process
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Reset both files to defaults
    pub fn clear_state(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.write_state_locked(&AgentRuntimeState::default())?;
        self.write_cycles_locked(&RecentCycles::default())
    }

    /// Complete status snapshot for the controller
    pub fn get_full_status(&self, alive_timeout_seconds: f64) -> Result<FullStatus> {
        let state = self.get_state()?;
        let cycles = self.get_recent_cycles()?;
        Ok(FullStatus {
            is_alive: self.is_agent_alive(alive_timeout_seconds),
            is_process_running: self.is_agent_process_running(),
            recent_cycles_count: cycles.cycles.len(),
            state,
        })
    }
}
