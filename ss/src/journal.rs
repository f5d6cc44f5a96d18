//! Cycle journal - structured row store of agent loop iterations
//!
//! Every cycle of the worker loop appends one row capturing the planning,
//! execution, and learning phases. The journal is a single-writer SQLite
//! database; writes serialize through an internal mutex and compound fields
//! are stored as JSON text columns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// Default retention cap for `cleanup_old_cycles`
pub const MAX_CYCLES_TO_KEEP: usize = 1000;

/// Full record of one agent cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLog {
    // Identification
    pub cycle_id: String,
    pub timestamp: DateTime<Utc>,

    // Planning phase
    pub planning_input_state: String,
    pub planning_input_recent_actions: Vec<String>,
    pub planning_output_action: String,
    /// Not every planner produces reasoning; absence is stored as NULL
    pub planning_output_reasoning: Option<String>,
    pub planning_duration_ms: u64,

    // Execution phase
    pub action_name: String,
    pub action_params: BTreeMap<String, serde_json::Value>,
    pub execution_result: BTreeMap<String, serde_json::Value>,
    pub execution_success: bool,
    pub execution_error: Option<String>,
    pub execution_duration_ms: u64,

    // Learning phase
    pub reward: f64,
    pub critique: Option<String>,
    pub lesson_learned: Option<String>,

    // Memory hooks
    pub memories_stored: Vec<String>,

    // Metadata
    pub llm_provider: String,
    pub llm_model: String,
    pub llm_tokens_used: u64,
    pub total_duration_ms: u64,
    pub agent_state_after: String,
}

impl CycleLog {
    /// Start a cycle record from the planning phase inputs
    pub fn new(
        state: &str,
        recent_actions: Vec<String>,
        action: &str,
        reasoning: Option<String>,
    ) -> Self {
        Self {
            cycle_id: generate_cycle_id(),
            timestamp: Utc::now(),
            planning_input_state: state.to_string(),
            planning_input_recent_actions: recent_actions,
            planning_output_action: action.to_string(),
            planning_output_reasoning: reasoning,
            planning_duration_ms: 0,
            action_name: action.to_string(),
            action_params: BTreeMap::new(),
            execution_result: BTreeMap::new(),
            execution_success: false,
            execution_error: None,
            execution_duration_ms: 0,
            reward: 0.0,
            critique: None,
            lesson_learned: None,
            memories_stored: Vec::new(),
            llm_provider: String::new(),
            llm_model: String::new(),
            llm_tokens_used: 0,
            total_duration_ms: 0,
            agent_state_after: String::new(),
        }
    }
}

/// Generate a unique cycle id
pub fn generate_cycle_id() -> String {
    let hex = Uuid::now_v7().simple().to_string();
    format!("cycle_{}", &hex[..12])
}

/// Aggregate statistics over the journal
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    /// Percentage in [0, 100]
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub total_rewards: f64,
    pub avg_reward: f64,
    pub action_counts: BTreeMap<String, u64>,
    /// Top five actions by count
    pub top_actions: Vec<String>,
    /// Total cycles over the observed span; 0 when the span is empty
    pub cycles_per_hour: f64,
    pub last_cycle_time: Option<DateTime<Utc>>,
}

/// Filters for `get_recent_cycles`
#[derive(Debug, Clone, Default)]
pub struct CycleFilter {
    pub action: Option<String>,
    pub success: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// SQLite-backed journal of cycle records
///
/// One instance per worker process; pass it by reference rather than through
/// a global.
pub struct CycleJournal {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl CycleJournal {
    /// Open (creating if needed) the journal at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        // Controller-side readers share this file with the writing worker
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cycles (
                cycle_id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                planning_input_state TEXT,
                planning_input_recent_actions TEXT,
                planning_output_action TEXT,
                planning_output_reasoning TEXT,
                planning_duration_ms INTEGER DEFAULT 0,
                action_name TEXT,
                action_params TEXT,
                execution_result TEXT,
                execution_success INTEGER DEFAULT 0,
                execution_error TEXT,
                execution_duration_ms INTEGER DEFAULT 0,
                reward REAL DEFAULT 0.0,
                critique TEXT,
                lesson_learned TEXT,
                memories_stored TEXT,
                llm_provider TEXT,
                llm_model TEXT,
                llm_tokens_used INTEGER DEFAULT 0,
                total_duration_ms INTEGER DEFAULT 0,
                agent_state_after TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_cycles_timestamp ON cycles(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_cycles_action ON cycles(action_name);
            CREATE INDEX IF NOT EXISTS idx_cycles_success ON cycles(execution_success);",
        )?;

        info!(db_path = %db_path.display(), "CycleJournal opened");
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Upsert one cycle record by `cycle_id`
    pub fn log_cycle(&self, cycle: &CycleLog) -> bool {
        let result = (|| -> Result<()> {
            let conn = self.conn.lock().expect("journal mutex poisoned");
            conn.execute(
                "INSERT OR REPLACE INTO cycles (
                    cycle_id, timestamp,
                    planning_input_state, planning_input_recent_actions,
                    planning_output_action, planning_output_reasoning, planning_duration_ms,
                    action_name, action_params, execution_result,
                    execution_success, execution_error, execution_duration_ms,
                    reward, critique, lesson_learned, memories_stored,
                    llm_provider, llm_model, llm_tokens_used,
                    total_duration_ms, agent_state_after
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                          ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                rusqlite::params![
                    cycle.cycle_id,
                    cycle.timestamp.to_rfc3339(),
                    cycle.planning_input_state,
                    serde_json::to_string(&cycle.planning_input_recent_actions)?,
                    cycle.planning_output_action,
                    cycle.planning_output_reasoning,
                    cycle.planning_duration_ms as i64,
                    cycle.action_name,
                    serde_json::to_string(&cycle.action_params)?,
                    serde_json::to_string(&cycle.execution_result)?,
                    cycle.execution_success as i64,
                    cycle.execution_error,
                    cycle.execution_duration_ms as i64,
                    cycle.reward,
                    cycle.critique,
                    cycle.lesson_learned,
                    serde_json::to_string(&cycle.memories_stored)?,
                    cycle.llm_provider,
                    cycle.llm_model,
                    cycle.llm_tokens_used as i64,
                    cycle.total_duration_ms as i64,
                    cycle.agent_state_after,
                ],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!(cycle_id = %cycle.cycle_id, "Logged cycle");
                true
            }
            Err(e) => {
                warn!(cycle_id = %cycle.cycle_id, error = %e, "Failed to log cycle");
                false
            }
        }
    }

    /// Fetch a specific cycle by id
    pub fn get_cycle(&self, cycle_id: &str) -> Result<Option<CycleLog>> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let row = conn
            .query_row(
                "SELECT * FROM cycles WHERE cycle_id = ?1",
                [cycle_id],
                row_to_cycle,
            )
            .optional()?;
        Ok(row)
    }

    /// Recent cycles ordered by timestamp descending, with optional filters
    pub fn get_recent_cycles(
        &self,
        limit: usize,
        offset: usize,
        filter: &CycleFilter,
    ) -> Result<Vec<CycleLog>> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(action) = &filter.action {
            conditions.push("action_name = ?");
            params.push(Box::new(action.clone()));
        }
        if let Some(success) = filter.success {
            conditions.push("execution_success = ?");
            params.push(Box::new(success as i64));
        }
        if let Some(start) = filter.start_time {
            conditions.push("timestamp >= ?");
            params.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = filter.end_time {
            conditions.push("timestamp <= ?");
            params.push(Box::new(end.to_rfc3339()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let query = format!(
            "SELECT * FROM cycles {where_clause} ORDER BY timestamp DESC LIMIT ? OFFSET ?"
        );
        params.push(Box::new(limit as i64));
        params.push(Box::new(offset as i64));

        let conn = self.conn.lock().expect("journal mutex poisoned");
        let mut stmt = conn.prepare(&query)?;
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(&refs[..], row_to_cycle)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Aggregate statistics, optionally bounded to a time window
    pub fn get_stats(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<CycleStats> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(start) = start_time {
            conditions.push("timestamp >= ?");
            params.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = end_time {
            conditions.push("timestamp <= ?");
            params.push(Box::new(end.to_rfc3339()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn.lock().expect("journal mutex poisoned");

        let (total, successful, failed, avg_duration, total_rewards, avg_reward, last, first) = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN execution_success = 1 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN execution_success = 0 THEN 1 ELSE 0 END), 0),
                            AVG(total_duration_ms),
                            SUM(reward),
                            AVG(reward),
                            MAX(timestamp),
                            MIN(timestamp)
                     FROM cycles {where_clause}"
                ),
                &refs[..],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT action_name, COUNT(*) as count FROM cycles {where_clause}
             GROUP BY action_name ORDER BY count DESC"
        ))?;
        let action_rows = stmt
            .query_map(&refs[..], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut action_counts = BTreeMap::new();
        let mut top_actions = Vec::new();
        for (name, count) in &action_rows {
            let name = name.clone().unwrap_or_default();
            if top_actions.len() < 5 {
                top_actions.push(name.clone());
            }
            action_counts.insert(name, *count);
        }

        let last_cycle_time = last.as_deref().and_then(parse_rfc3339);
        let first_cycle_time = first.as_deref().and_then(parse_rfc3339);
        let cycles_per_hour = match (first_cycle_time, last_cycle_time) {
            (Some(first), Some(last)) if total > 0 => {
                let hours = (last - first).num_milliseconds() as f64 / 3_600_000.0;
                if hours > 0.0 { total as f64 / hours } else { 0.0 }
            }
            _ => 0.0,
        };

        Ok(CycleStats {
            total_cycles: total,
            successful_cycles: successful,
            failed_cycles: failed,
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            avg_duration_ms: avg_duration.unwrap_or(0.0),
            total_rewards: total_rewards.unwrap_or(0.0),
            avg_reward: avg_reward.unwrap_or(0.0),
            action_counts,
            top_actions,
            cycles_per_hour,
            last_cycle_time,
        })
    }

    /// Delete oldest rows until at most `keep_count` remain
    pub fn cleanup_old_cycles(&self, keep_count: usize) -> Result<usize> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let total: u64 = conn.query_row("SELECT COUNT(*) FROM cycles", [], |r| r.get::<_, i64>(0))? as u64;
        if total as usize <= keep_count {
            return Ok(0);
        }
        let deleted = conn.execute(
            "DELETE FROM cycles WHERE cycle_id IN (
                SELECT cycle_id FROM cycles ORDER BY timestamp ASC LIMIT ?1
            )",
            [(total as usize - keep_count) as i64],
        )?;
        info!(deleted, "Cleaned up old cycles");
        Ok(deleted)
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a JSON text column, tolerating legacy rows holding bare values
fn parse_json_column<T: serde::de::DeserializeOwned + Default>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn row_to_cycle(row: &rusqlite::Row<'_>) -> rusqlite::Result<CycleLog> {
    let timestamp_raw: String = row.get("timestamp")?;
    Ok(CycleLog {
        cycle_id: row.get("cycle_id")?,
        timestamp: parse_rfc3339(&timestamp_raw).unwrap_or_default(),
        planning_input_state: row.get::<_, Option<String>>("planning_input_state")?.unwrap_or_default(),
        planning_input_recent_actions: parse_json_column(
            row.get::<_, Option<String>>("planning_input_recent_actions")?,
        ),
        planning_output_action: row
            .get::<_, Option<String>>("planning_output_action")?
            .unwrap_or_default(),
        planning_output_reasoning: row.get("planning_output_reasoning")?,
        planning_duration_ms: row.get::<_, Option<i64>>("planning_duration_ms")?.unwrap_or(0) as u64,
        action_name: row.get::<_, Option<String>>("action_name")?.unwrap_or_default(),
        action_params: parse_json_column(row.get::<_, Option<String>>("action_params")?),
        execution_result: parse_json_column(row.get::<_, Option<String>>("execution_result")?),
        execution_success: row.get::<_, Option<i64>>("execution_success")?.unwrap_or(0) != 0,
        execution_error: row.get("execution_error")?,
        execution_duration_ms: row
            .get::<_, Option<i64>>("execution_duration_ms")?
            .unwrap_or(0) as u64,
        reward: row.get::<_, Option<f64>>("reward")?.unwrap_or(0.0),
        critique: row.get("critique")?,
        lesson_learned: row.get("lesson_learned")?,
        memories_stored: parse_json_column(row.get::<_, Option<String>>("memories_stored")?),
        llm_provider: row.get::<_, Option<String>>("llm_provider")?.unwrap_or_default(),
        llm_model: row.get::<_, Option<String>>("llm_model")?.unwrap_or_default(),
        llm_tokens_used: row.get::<_, Option<i64>>("llm_tokens_used")?.unwrap_or(0) as u64,
        total_duration_ms: row.get::<_, Option<i64>>("total_duration_ms")?.unwrap_or(0) as u64,
        agent_state_after: row
            .get::<_, Option<String>>("agent_state_after")?
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal() -> (TempDir, CycleJournal) {
        let dir = TempDir::new().unwrap();
        let journal = CycleJournal::open(dir.path().join("cycles.db")).unwrap();
        (dir, journal)
    }

    fn sample_cycle(action: &str, success: bool, reward: f64) -> CycleLog {
        let mut cycle = CycleLog::new("idle", vec!["observe".into()], action, Some("why not".into()));
        cycle.execution_success = success;
        cycle.reward = reward;
        cycle.total_duration_ms = 120;
        cycle.agent_state_after = "idle".into();
        cycle
            .execution_result
            .insert("outcome".into(), serde_json::json!("ok"));
        cycle
    }

    #[test]
    fn test_log_and_get_roundtrip() {
        let (_dir, journal) = journal();
        let cycle = sample_cycle("observe", true, 0.7);

        assert!(journal.log_cycle(&cycle));
        let fetched = journal.get_cycle(&cycle.cycle_id).unwrap().unwrap();
        assert_eq!(fetched.cycle_id, cycle.cycle_id);
        assert_eq!(fetched.planning_input_recent_actions, cycle.planning_input_recent_actions);
        assert_eq!(fetched.execution_result, cycle.execution_result);
        assert_eq!(fetched.planning_output_reasoning, cycle.planning_output_reasoning);
        assert!(fetched.execution_success);
    }

    #[test]
    fn test_log_cycle_upserts_by_id() {
        let (_dir, journal) = journal();
        let mut cycle = sample_cycle("observe", false, -0.5);
        journal.log_cycle(&cycle);

        cycle.execution_success = true;
        cycle.reward = 0.9;
        journal.log_cycle(&cycle);

        let stats = journal.get_stats(None, None).unwrap();
        assert_eq!(stats.total_cycles, 1);
        let fetched = journal.get_cycle(&cycle.cycle_id).unwrap().unwrap();
        assert!(fetched.execution_success);
    }

    #[test]
    fn test_missing_reasoning_accepted() {
        let (_dir, journal) = journal();
        let cycle = CycleLog::new("idle", vec![], "wait", None);
        journal.log_cycle(&cycle);
        let fetched = journal.get_cycle(&cycle.cycle_id).unwrap().unwrap();
        assert!(fetched.planning_output_reasoning.is_none());
    }

    #[test]
    fn test_recent_cycles_filters_and_order() {
        let (_dir, journal) = journal();
        let mut first = sample_cycle("observe", true, 0.5);
        first.timestamp = Utc::now() - chrono::Duration::minutes(2);
        let mut second = sample_cycle("post", false, -0.5);
        second.timestamp = Utc::now() - chrono::Duration::minutes(1);
        let third = sample_cycle("observe", false, -0.2);
        journal.log_cycle(&first);
        journal.log_cycle(&second);
        journal.log_cycle(&third);

        let all = journal
            .get_recent_cycles(10, 0, &CycleFilter::default())
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].cycle_id, third.cycle_id);

        let observes = journal
            .get_recent_cycles(
                10,
                0,
                &CycleFilter {
                    action: Some("observe".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(observes.len(), 2);

        let failures = journal
            .get_recent_cycles(
                10,
                0,
                &CycleFilter {
                    success: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(failures.len(), 2);

        let paged = journal
            .get_recent_cycles(1, 1, &CycleFilter::default())
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].cycle_id, second.cycle_id);
    }

    #[test]
    fn test_stats_aggregates() {
        let (_dir, journal) = journal();
        let mut old = sample_cycle("observe", true, 1.0);
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        journal.log_cycle(&old);
        journal.log_cycle(&sample_cycle("observe", true, 0.5));
        journal.log_cycle(&sample_cycle("post", false, -0.5));

        let stats = journal.get_stats(None, None).unwrap();
        assert_eq!(stats.total_cycles, 3);
        assert_eq!(stats.successful_cycles, 2);
        assert_eq!(stats.failed_cycles, 1);
        assert!((stats.success_rate - 66.666).abs() < 0.1);
        assert!((stats.total_rewards - 1.0).abs() < 1e-9);
        assert_eq!(stats.action_counts["observe"], 2);
        assert_eq!(stats.top_actions[0], "observe");
        assert!(stats.cycles_per_hour > 0.0);
        assert!(stats.last_cycle_time.is_some());
    }

    #[test]
    fn test_stats_empty_journal() {
        let (_dir, journal) = journal();
        let stats = journal.get_stats(None, None).unwrap();
        assert_eq!(stats.total_cycles, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.cycles_per_hour, 0.0);
        assert!(stats.last_cycle_time.is_none());
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let (_dir, journal) = journal();
        for i in 0..10 {
            let mut cycle = sample_cycle("observe", true, 0.1);
            cycle.timestamp = Utc::now() - chrono::Duration::minutes(10 - i);
            journal.log_cycle(&cycle);
        }

        assert_eq!(journal.cleanup_old_cycles(3).unwrap(), 7);
        let remaining = journal
            .get_recent_cycles(100, 0, &CycleFilter::default())
            .unwrap();
        assert_eq!(remaining.len(), 3);
        // Oldest removed, newest kept
        assert!(remaining.iter().all(|c| {
            (Utc::now() - c.timestamp).num_minutes() <= 3
        }));

        assert_eq!(journal.cleanup_old_cycles(MAX_CYCLES_TO_KEEP).unwrap(), 0);
    }

    #[test]
    fn test_legacy_text_columns_tolerated() {
        let (_dir, journal) = journal();
        {
            let conn = journal.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO cycles (cycle_id, timestamp, action_params, memories_stored)
                 VALUES ('cycle_legacy', ?1, 'not json', '')",
                [Utc::now().to_rfc3339()],
            )
            .unwrap();
        }
        let fetched = journal.get_cycle("cycle_legacy").unwrap().unwrap();
        assert!(fetched.action_params.is_empty());
        assert!(fetched.memories_stored.is_empty());
    }
}
