//! Scheduled task types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::events::EventPriority;

/// Recurrence patterns for scheduled tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Once,
    Hourly,
    Daily,
    Weekly,
    /// Approximated as 30 days
    Monthly,
    /// Uses `custom_interval`
    Custom,
}

/// A task scheduled for future execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    pub next_run: DateTime<Utc>,
    pub recurrence: Recurrence,
    /// Interval in seconds for [`Recurrence::Custom`]
    #[serde(default)]
    pub custom_interval: Option<f64>,
    pub priority: EventPriority,
    pub enabled: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    /// `None` = unlimited
    #[serde(default)]
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Build a new task due at `next_run`
    pub fn new(name: &str, next_run: DateTime<Utc>, recurrence: Recurrence) -> Self {
        Self {
            task_id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            payload: Value::Object(serde_json::Map::new()),
            next_run,
            recurrence,
            custom_interval: None,
            priority: EventPriority::Low,
            enabled: true,
            last_run: None,
            run_count: 0,
            max_runs: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the task should fire now
    pub fn is_due(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.max_runs.is_some_and(|max| self.run_count >= max) {
            return false;
        }
        Utc::now() >= self.next_run
    }

    /// Next run time per the recurrence pattern, or `None` when the task has
    /// no further runs
    pub fn calculate_next_run(&self) -> Option<DateTime<Utc>> {
        if self.recurrence == Recurrence::Once {
            return None;
        }
        if self.max_runs.is_some_and(|max| self.run_count >= max) {
            return None;
        }

        let base = self.next_run;
        match self.recurrence {
            Recurrence::Once => None,
            Recurrence::Hourly => Some(base + Duration::hours(1)),
            Recurrence::Daily => Some(base + Duration::days(1)),
            Recurrence::Weekly => Some(base + Duration::weeks(1)),
            Recurrence::Monthly => Some(base + Duration::days(30)),
            Recurrence::Custom => self
                .custom_interval
                .map(|secs| base + Duration::milliseconds((secs * 1000.0) as i64)),
        }
    }

    /// Record a run: bumps `run_count`, sets `last_run`, advances `next_run`
    pub fn mark_run(&mut self) {
        self.last_run = Some(Utc::now());
        self.run_count += 1;
        if let Some(next) = self.calculate_next_run() {
            self.next_run = next;
        }
    }

    /// Whether the task is spent (one-shot fired, or max runs reached)
    pub fn is_exhausted(&self) -> bool {
        if self.run_count == 0 {
            return false;
        }
        self.recurrence == Recurrence::Once
            || self.max_runs.is_some_and(|max| self.run_count >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_is_due() {
        let mut task = ScheduledTask::new("t", Utc::now() - Duration::seconds(1), Recurrence::Once);
        assert!(task.is_due());

        task.enabled = false;
        assert!(!task.is_due());

        task.enabled = true;
        task.max_runs = Some(1);
        task.run_count = 1;
        assert!(!task.is_due());

        let future = ScheduledTask::new("t", Utc::now() + Duration::hours(1), Recurrence::Once);
        assert!(!future.is_due());
    }

    #[test]
    fn test_daily_recurrence_advances_one_day() {
        let start = Utc::now();
        let mut task = ScheduledTask::new("t", start, Recurrence::Daily);

        task.mark_run();
        assert_eq!(task.run_count, 1);
        assert_eq!(task.next_run, start + Duration::days(1));
        assert!(task.last_run.is_some());
    }

    #[test]
    fn test_once_keeps_next_run_and_exhausts() {
        let start = Utc::now();
        let mut task = ScheduledTask::new("t", start, Recurrence::Once);
        assert!(task.calculate_next_run().is_none());

        task.mark_run();
        assert_eq!(task.next_run, start);
        assert!(task.is_exhausted());
    }

    #[test]
    fn test_custom_recurrence() {
        let start = Utc::now();
        let mut task = ScheduledTask::new("t", start, Recurrence::Custom);
        task.custom_interval = Some(90.0);

        task.mark_run();
        assert_eq!(task.next_run, start + Duration::seconds(90));

        // Custom without an interval has no next run
        let mut bare = ScheduledTask::new("t", start, Recurrence::Custom);
        bare.mark_run();
        assert_eq!(bare.next_run, start);
    }

    #[test]
    fn test_max_runs_exhaustion() {
        let mut task = ScheduledTask::new("t", Utc::now(), Recurrence::Hourly);
        task.max_runs = Some(2);

        task.mark_run();
        assert!(!task.is_exhausted());
        task.mark_run();
        assert!(task.is_exhausted());
        assert!(!task.is_due());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut task = ScheduledTask::new("nightly", Utc::now(), Recurrence::Daily);
        task.payload = serde_json::json!({"k": 1});
        task.priority = EventPriority::Normal;

        let raw = serde_json::to_string(&task).unwrap();
        let parsed: ScheduledTask = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, task);
        assert!(raw.contains("\"daily\""));
    }

    proptest! {
        #[test]
        fn prop_mark_run_monotonic(runs in 1u32..20) {
            let mut task = ScheduledTask::new("t", Utc::now(), Recurrence::Hourly);
            let mut prev = task.next_run;
            for _ in 0..runs {
                task.mark_run();
                prop_assert!(task.next_run > prev);
                prev = task.next_run;
            }
            prop_assert_eq!(task.run_count, runs);
        }
    }
}
