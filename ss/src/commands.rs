//! Durable command queue for IPC between controller and worker
//!
//! Each command is one JSON file; its lifecycle is encoded by the directory it
//! lives in (`pending/`, `completed/`, `failed/`). Moves between lifecycle
//! states are filesystem renames, atomic within one filesystem, and the
//! in-file `status` is rewritten with every move so file and directory agree.
//!
//! The `completed/` directory is the terminal home for accepted commands and
//! holds both `processing` and `completed` files; `failed/` holds rejected and
//! expired ones.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Types of commands that can be sent to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Start,
    Stop,
    Pause,
    Resume,
    ExecuteAction,
    ReloadConfig,
    /// Graceful process shutdown
    Shutdown,
}

/// Lifecycle status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    /// Whether this status is terminal from the producer's point of view
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

/// A single command exchanged through the queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCommand {
    pub command_id: String,
    pub command_type: CommandType,
    pub created_at: DateTime<Utc>,
    pub status: CommandStatus,
    #[serde(default)]
    pub params: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub result: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AgentCommand {
    /// Whether the command has passed its expiry deadline
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|expires| Utc::now() > expires)
    }
}

/// Per-directory counts for the queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandQueueStats {
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// File-backed command queue with lifecycle directories
pub struct CommandQueue {
    command_dir: PathBuf,
    pending_dir: PathBuf,
    completed_dir: PathBuf,
    failed_dir: PathBuf,
}

impl CommandQueue {
    /// Open (creating if needed) a command queue rooted at `command_dir`
    pub fn new(command_dir: impl AsRef<Path>) -> Result<Self> {
        let command_dir = command_dir.as_ref().to_path_buf();
        let queue = Self {
            pending_dir: command_dir.join("pending"),
            completed_dir: command_dir.join("completed"),
            failed_dir: command_dir.join("failed"),
            command_dir,
        };
        for dir in [&queue.pending_dir, &queue.completed_dir, &queue.failed_dir] {
            fs::create_dir_all(dir)?;
        }
        debug!(command_dir = %queue.command_dir.display(), "CommandQueue initialized");
        Ok(queue)
    }

    /// Root directory of this queue
    pub fn command_dir(&self) -> &Path {
        &self.command_dir
    }

    fn generate_command_id() -> String {
        // v7 ids are time-ordered, so filename sort equals creation order
        let hex = Uuid::now_v7().simple().to_string();
        format!("cmd_{}", &hex[..12])
    }

    fn path_for(&self, command_id: &str, status: CommandStatus) -> PathBuf {
        let dir = match status {
            CommandStatus::Pending => &self.pending_dir,
            CommandStatus::Processing | CommandStatus::Completed => &self.completed_dir,
            CommandStatus::Failed | CommandStatus::Expired => &self.failed_dir,
        };
        dir.join(format!("{command_id}.json"))
    }

    fn write_command(&self, command: &AgentCommand) -> Result<()> {
        let path = self.path_for(&command.command_id, command.status);
        fs::write(&path, serde_json::to_string_pretty(command)?)?;
        Ok(())
    }

    fn read_command(&self, path: &Path) -> Result<Option<AgentCommand>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        match serde_json::from_str(&raw) {
            Ok(command) => Ok(Some(command)),
            Err(source) => {
                warn!(path = %path.display(), error = %source, "Malformed command file");
                Err(StoreError::MalformedCommand {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Locate a command in whichever lifecycle directory currently holds it
    fn locate(&self, command_id: &str) -> Option<(PathBuf, AgentCommand)> {
        for dir in [&self.pending_dir, &self.completed_dir, &self.failed_dir] {
            let path = dir.join(format!("{command_id}.json"));
            if let Ok(Some(command)) = self.read_command(&path) {
                return Some((path, command));
            }
        }
        None
    }

    // === Producer (controller) interface ===

    /// Write a fresh pending command
    ///
    /// `timeout_seconds > 0` sets `expires_at`; the worker transitions
    /// commands past their expiry to `failed/expired` at enumeration time.
    pub fn send_command(
        &self,
        command_type: CommandType,
        params: Option<BTreeMap<String, serde_json::Value>>,
        timeout_seconds: f64,
    ) -> Result<AgentCommand> {
        let now = Utc::now();
        let expires_at = (timeout_seconds > 0.0)
            .then(|| now + chrono::Duration::milliseconds((timeout_seconds * 1000.0) as i64));

        let command = AgentCommand {
            command_id: Self::generate_command_id(),
            command_type,
            created_at: now,
            status: CommandStatus::Pending,
            params,
            result: None,
            error: None,
            completed_at: None,
            expires_at,
        };
        self.write_command(&command)?;
        info!(command_id = %command.command_id, ?command_type, "Sent command");
        Ok(command)
    }

    /// Read a command from the first lifecycle directory that contains it
    pub fn get_command_status(&self, command_id: &str) -> Option<AgentCommand> {
        self.locate(command_id).map(|(_, command)| command)
    }

    /// Poll until the command reaches a terminal status or the wait times out
    pub fn wait_for_command(
        &self,
        command_id: &str,
        timeout_seconds: f64,
        poll_interval: f64,
    ) -> Option<AgentCommand> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout_seconds);
        loop {
            if let Some(command) = self.get_command_status(command_id) {
                if command.status.is_terminal() {
                    return Some(command);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_secs_f64(poll_interval));
        }
    }

    // === Consumer (worker) interface ===

    /// All pending commands, oldest first; expired ones are transitioned to
    /// `failed` as they are encountered
    pub fn get_pending_commands(&self) -> Result<Vec<AgentCommand>> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.pending_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        names.sort();

        let mut commands = Vec::new();
        for path in names {
            let Ok(Some(mut command)) = self.read_command(&path) else {
                continue;
            };
            if command.is_expired() {
                command.status = CommandStatus::Expired;
                command.error = Some("Command expired".to_string());
                let failed_path = self.path_for(&command.command_id, CommandStatus::Expired);
                fs::rename(&path, &failed_path)?;
                fs::write(&failed_path, serde_json::to_string_pretty(&command)?)?;
                warn!(command_id = %command.command_id, "Command expired");
            } else {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    /// The oldest pending command, if any
    pub fn get_next_command(&self) -> Result<Option<AgentCommand>> {
        Ok(self.get_pending_commands()?.into_iter().next())
    }

    /// Move a pending command into the terminal directory as `processing`
    ///
    /// After this succeeds no other consumer can pick the command up.
    pub fn mark_processing(&self, command_id: &str) -> Result<AgentCommand> {
        let pending_path = self.path_for(command_id, CommandStatus::Pending);
        let Some(mut command) = self.read_command(&pending_path)? else {
            return Err(StoreError::CommandNotFound(command_id.to_string()));
        };

        command.status = CommandStatus::Processing;
        let dest = self.path_for(command_id, CommandStatus::Processing);
        fs::rename(&pending_path, &dest)?;
        fs::write(&dest, serde_json::to_string_pretty(&command)?)?;

        debug!(%command_id, "Command marked processing");
        Ok(command)
    }

    /// Mark a command completed with an optional result map
    ///
    /// Idempotent: a second call on a completed command returns the stored
    /// terminal file unchanged.
    pub fn mark_completed(
        &self,
        command_id: &str,
        result: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<AgentCommand> {
        let Some((path, mut command)) = self.locate(command_id) else {
            return Err(StoreError::CommandNotFound(command_id.to_string()));
        };
        if command.status == CommandStatus::Completed {
            return Ok(command);
        }

        command.status = CommandStatus::Completed;
        command.completed_at = Some(Utc::now());
        command.result = result;

        let dest = self.path_for(command_id, CommandStatus::Completed);
        if path != dest {
            fs::rename(&path, &dest)?;
        }
        fs::write(&dest, serde_json::to_string_pretty(&command)?)?;

        debug!(%command_id, "Command completed");
        Ok(command)
    }

    /// Mark a command failed with an error message
    pub fn mark_failed(&self, command_id: &str, error: &str) -> Result<AgentCommand> {
        let Some((path, mut command)) = self.locate(command_id) else {
            return Err(StoreError::CommandNotFound(command_id.to_string()));
        };
        if command.status == CommandStatus::Failed {
            return Ok(command);
        }

        command.status = CommandStatus::Failed;
        command.completed_at = Some(Utc::now());
        command.error = Some(error.to_string());

        let dest = self.path_for(command_id, CommandStatus::Failed);
        if path != dest {
            fs::rename(&path, &dest)?;
        }
        fs::write(&dest, serde_json::to_string_pretty(&command)?)?;

        debug!(%command_id, error, "Command failed");
        Ok(command)
    }

    // === Retention ===

    /// Delete terminal command files older than `max_age_hours`
    pub fn cleanup_old_commands(&self, max_age_hours: f64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds((max_age_hours * 3_600_000.0) as i64);
        let mut cleaned = 0;

        for dir in [&self.completed_dir, &self.failed_dir] {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let Ok(Some(command)) = self.read_command(&path) else {
                    continue;
                };
                if command.completed_at.is_some_and(|done| done < cutoff) {
                    fs::remove_file(&path)?;
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            info!(cleaned, "Cleaned up old commands");
        }
        Ok(cleaned)
    }

    /// Per-directory counts
    pub fn get_statistics(&self) -> Result<CommandQueueStats> {
        let count = |dir: &Path| -> Result<usize> {
            Ok(fs::read_dir(dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count())
        };
        let pending = count(&self.pending_dir)?;
        let completed = count(&self.completed_dir)?;
        let failed = count(&self.failed_dir)?;
        Ok(CommandQueueStats {
            pending,
            completed,
            failed,
            total: pending + completed + failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue() -> (TempDir, CommandQueue) {
        let dir = TempDir::new().unwrap();
        let queue = CommandQueue::new(dir.path().join("commands")).unwrap();
        (dir, queue)
    }

    fn dir_holding(queue: &CommandQueue, id: &str) -> Vec<&'static str> {
        let mut dirs = Vec::new();
        if queue.pending_dir.join(format!("{id}.json")).exists() {
            dirs.push("pending");
        }
        if queue.completed_dir.join(format!("{id}.json")).exists() {
            dirs.push("completed");
        }
        if queue.failed_dir.join(format!("{id}.json")).exists() {
            dirs.push("failed");
        }
        dirs
    }

    #[test]
    fn test_send_and_read_back() {
        let (_dir, queue) = queue();
        let sent = queue.send_command(CommandType::Start, None, 60.0).unwrap();

        assert_eq!(sent.status, CommandStatus::Pending);
        assert!(sent.expires_at.is_some());

        let read = queue.get_command_status(&sent.command_id).unwrap();
        assert_eq!(read, sent);
        assert_eq!(dir_holding(&queue, &sent.command_id), vec!["pending"]);
    }

    #[test]
    fn test_zero_timeout_means_no_expiry() {
        let (_dir, queue) = queue();
        let sent = queue.send_command(CommandType::Stop, None, 0.0).unwrap();
        assert!(sent.expires_at.is_none());
        assert!(!sent.is_expired());
    }

    #[test]
    fn test_lifecycle_exactly_one_directory() {
        let (_dir, queue) = queue();
        let sent = queue.send_command(CommandType::Pause, None, 60.0).unwrap();
        let id = sent.command_id.clone();

        let processing = queue.mark_processing(&id).unwrap();
        assert_eq!(processing.status, CommandStatus::Processing);
        assert_eq!(dir_holding(&queue, &id), vec!["completed"]);

        let mut result = BTreeMap::new();
        result.insert("status".to_string(), serde_json::json!("paused"));
        let completed = queue.mark_completed(&id, Some(result)).unwrap();
        assert_eq!(completed.status, CommandStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert_eq!(dir_holding(&queue, &id), vec!["completed"]);

        // File body agrees with its directory
        let on_disk = queue.get_command_status(&id).unwrap();
        assert_eq!(on_disk.status, CommandStatus::Completed);
    }

    #[test]
    fn test_mark_completed_idempotent() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::Resume, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();

        let first = queue.mark_completed(&id, None).unwrap();
        let second = queue.mark_completed(&id, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mark_failed_moves_to_failed_dir() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::ExecuteAction, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();

        let failed = queue.mark_failed(&id, "executor unavailable").unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("executor unavailable"));
        assert_eq!(dir_holding(&queue, &id), vec!["failed"]);
    }

    #[test]
    fn test_processing_command_not_re_enumerated() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::Start, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();

        assert!(queue.get_pending_commands().unwrap().is_empty());
        assert!(queue.get_next_command().unwrap().is_none());
    }

    #[test]
    fn test_pending_ordering_oldest_first() {
        let (_dir, queue) = queue();
        let first = queue.send_command(CommandType::Start, None, 60.0).unwrap();
        let second = queue.send_command(CommandType::Stop, None, 60.0).unwrap();

        let pending = queue.get_pending_commands().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].command_id, first.command_id);
        assert_eq!(pending[1].command_id, second.command_id);
    }

    #[test]
    fn test_expired_command_transitioned_once() {
        let (_dir, queue) = queue();
        let mut cmd = queue.send_command(CommandType::Start, None, 60.0).unwrap();
        // Rewrite with an expiry in the past
        cmd.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        queue.write_command(&cmd).unwrap();

        assert!(queue.get_pending_commands().unwrap().is_empty());
        assert_eq!(dir_holding(&queue, &cmd.command_id), vec!["failed"]);

        let expired = queue.get_command_status(&cmd.command_id).unwrap();
        assert_eq!(expired.status, CommandStatus::Expired);
        assert_eq!(expired.error.as_deref(), Some("Command expired"));

        // A second enumeration does not touch it again
        assert!(queue.get_pending_commands().unwrap().is_empty());
        assert_eq!(dir_holding(&queue, &cmd.command_id), vec!["failed"]);
    }

    #[test]
    fn test_wait_for_command_times_out() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::Start, None, 60.0)
            .unwrap()
            .command_id;
        assert!(queue.wait_for_command(&id, 0.2, 0.05).is_none());
    }

    #[test]
    fn test_wait_for_command_sees_terminal_state() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::Start, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();
        queue.mark_completed(&id, None).unwrap();

        let done = queue.wait_for_command(&id, 1.0, 0.05).unwrap();
        assert_eq!(done.status, CommandStatus::Completed);
    }

    #[test]
    fn test_cleanup_old_commands() {
        let (_dir, queue) = queue();
        let id = queue
            .send_command(CommandType::Stop, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();
        let mut done = queue.mark_completed(&id, None).unwrap();

        // Age the terminal file beyond the cutoff
        done.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        queue.write_command(&done).unwrap();

        assert_eq!(queue.cleanup_old_commands(24.0).unwrap(), 1);
        assert!(queue.get_command_status(&id).is_none());
    }

    #[test]
    fn test_statistics_counts_per_directory() {
        let (_dir, queue) = queue();
        queue.send_command(CommandType::Start, None, 60.0).unwrap();
        let id = queue
            .send_command(CommandType::Stop, None, 60.0)
            .unwrap()
            .command_id;
        queue.mark_processing(&id).unwrap();

        let stats = queue.get_statistics().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn test_pending_lifecycle_always_single_directory() {
        use proptest::prelude::*;

        // Any interleaving of lifecycle transitions leaves the command in
        // exactly one directory with an agreeing status
        proptest!(ProptestConfig::with_cases(16), |(complete in proptest::bool::ANY, retry in proptest::bool::ANY)| {
            let (_dir, queue) = queue();
            let id = queue
                .send_command(CommandType::Start, None, 60.0)
                .unwrap()
                .command_id;
            prop_assert_eq!(dir_holding(&queue, &id), vec!["pending"]);

            queue.mark_processing(&id).unwrap();
            prop_assert_eq!(dir_holding(&queue, &id), vec!["completed"]);

            let expected_dir = if complete {
                queue.mark_completed(&id, None).unwrap();
                if retry {
                    queue.mark_completed(&id, None).unwrap();
                }
                "completed"
            } else {
                queue.mark_failed(&id, "boom").unwrap();
                if retry {
                    queue.mark_failed(&id, "boom again").unwrap();
                }
                "failed"
            };
            prop_assert_eq!(dir_holding(&queue, &id), vec![expected_dir]);

            let on_disk = queue.get_command_status(&id).unwrap();
            prop_assert!(on_disk.status.is_terminal());
        });
    }

    #[test]
    fn test_command_serde_roundtrip() {
        let command = AgentCommand {
            command_id: "cmd_0123456789ab".into(),
            command_type: CommandType::ExecuteAction,
            created_at: Utc::now(),
            status: CommandStatus::Pending,
            params: Some(BTreeMap::from([(
                "action".to_string(),
                serde_json::json!("observe"),
            )])),
            result: None,
            error: None,
            completed_at: None,
            expires_at: None,
        };
        let raw = serde_json::to_string(&command).unwrap();
        let parsed: AgentCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, command);
        assert!(raw.contains("\"execute_action\""));
    }
}
