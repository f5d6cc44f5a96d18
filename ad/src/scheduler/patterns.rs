//! Pattern learner - learns optimal timing from action history

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::debug;

use super::task::{Recurrence, ScheduledTask};

/// Minimum observations before an optimal hour is suggested
const MIN_OBSERVATIONS: usize = 10;

#[derive(Debug, Clone)]
struct ActionRecord {
    action: String,
    hour: u32,
    success: bool,
    metrics: BTreeMap<String, f64>,
}

/// Learns which hour of the day an action performs best at
#[derive(Default)]
pub struct PatternLearner {
    history: Mutex<Vec<ActionRecord>>,
}

impl PatternLearner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one action occurrence
    pub fn record_action(
        &self,
        action: &str,
        timestamp: DateTime<Utc>,
        success: bool,
        metrics: Option<BTreeMap<String, f64>>,
    ) {
        self.history
            .lock()
            .expect("pattern history poisoned")
            .push(ActionRecord {
                action: action.to_string(),
                hour: timestamp.hour(),
                success,
                metrics: metrics.unwrap_or_default(),
            });
    }

    /// The hour (0-23) with the best mean score for `action`, or `None`
    /// with fewer than ten observations
    ///
    /// `metric` is `"success"` or the name of a recorded custom metric.
    pub fn get_optimal_time(&self, action: &str, metric: &str) -> Option<u32> {
        let history = self.history.lock().expect("pattern history poisoned");
        let records: Vec<&ActionRecord> = history.iter().filter(|r| r.action == action).collect();
        if records.len() < MIN_OBSERVATIONS {
            return None;
        }

        let mut hour_scores: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for record in records {
            let score = if metric == "success" {
                Some(if record.success { 1.0 } else { 0.0 })
            } else {
                record.metrics.get(metric).copied()
            };
            if let Some(score) = score {
                hour_scores.entry(record.hour).or_default().push(score);
            }
        }

        let mut best: Option<(u32, f64)> = None;
        for (hour, scores) in hour_scores {
            if scores.is_empty() {
                continue;
            }
            let avg = scores.iter().sum::<f64>() / scores.len() as f64;
            if best.is_none_or(|(_, score)| avg > score) {
                best = Some((hour, avg));
            }
        }

        let hour = best.map(|(hour, _)| hour);
        debug!(action, metric, ?hour, "PatternLearner::get_optimal_time");
        hour
    }

    /// Propose a task at the learned optimal hour, or `None` without enough
    /// data
    pub fn suggest_schedule(&self, action: &str, recurrence: Recurrence) -> Option<ScheduledTask> {
        let optimal_hour = self.get_optimal_time(action, "success")?;

        let now = Utc::now();
        let mut next_run = now
            .with_hour(optimal_hour)?
            .with_minute(0)?
            .with_second(0)?
            .with_nanosecond(0)?;
        if next_run <= now {
            next_run += Duration::days(1);
        }

        let mut task = ScheduledTask::new(&format!("learned_{action}"), next_run, recurrence);
        task.payload = serde_json::json!({"action": action, "learned": true});
        Some(task)
    }

    /// Drop all recorded history
    pub fn clear(&self) {
        self.history.lock().expect("pattern history poisoned").clear();
    }

    /// Number of recorded observations
    pub fn observation_count(&self) -> usize {
        self.history.lock().expect("pattern history poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc::now()
            .with_hour(hour)
            .unwrap()
            .with_minute(30)
            .unwrap()
    }

    #[test]
    fn test_needs_ten_observations() {
        let learner = PatternLearner::new();
        for _ in 0..9 {
            learner.record_action("post", at_hour(9), true, None);
        }
        assert!(learner.get_optimal_time("post", "success").is_none());

        learner.record_action("post", at_hour(9), true, None);
        assert_eq!(learner.get_optimal_time("post", "success"), Some(9));
    }

    #[test]
    fn test_best_hour_by_success_rate() {
        let learner = PatternLearner::new();
        // Hour 9: all failures; hour 14: all successes
        for _ in 0..6 {
            learner.record_action("post", at_hour(9), false, None);
        }
        for _ in 0..6 {
            learner.record_action("post", at_hour(14), true, None);
        }
        assert_eq!(learner.get_optimal_time("post", "success"), Some(14));
    }

    #[test]
    fn test_custom_metric() {
        let learner = PatternLearner::new();
        for hour in [8, 20] {
            for _ in 0..6 {
                let mut metrics = BTreeMap::new();
                metrics.insert("engagement".to_string(), if hour == 20 { 0.9 } else { 0.2 });
                learner.record_action("post", at_hour(hour), true, Some(metrics));
            }
        }
        assert_eq!(learner.get_optimal_time("post", "engagement"), Some(20));
    }

    #[test]
    fn test_actions_are_independent() {
        let learner = PatternLearner::new();
        for _ in 0..12 {
            learner.record_action("post", at_hour(9), true, None);
        }
        assert!(learner.get_optimal_time("search", "success").is_none());
    }

    #[test]
    fn test_suggest_schedule_daily_at_learned_hour() {
        let learner = PatternLearner::new();
        for _ in 0..12 {
            learner.record_action("post", at_hour(7), true, None);
        }

        let task = learner.suggest_schedule("post", Recurrence::Daily).unwrap();
        assert_eq!(task.name, "learned_post");
        assert_eq!(task.next_run.hour(), 7);
        assert!(task.next_run > Utc::now());
        assert_eq!(task.recurrence, Recurrence::Daily);
        assert_eq!(task.payload["learned"], serde_json::json!(true));
    }
}
