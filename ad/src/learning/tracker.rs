//! Action tracker - success rates per action and per context

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Window for `recent_success_rate`
const RECENT_WINDOW_SIZE: usize = 20;
/// Cap on rewards kept per (context, action) pair
const MAX_CONTEXT_REWARDS: usize = 100;
/// Cap on raw outcome history
const MAX_OUTCOMES: usize = 1000;

/// A single recorded action outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub id: String,
    pub action: String,
    pub context_key: String,
    /// Reward in [-1, 1]
    pub reward: f64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Aggregated statistics for one action
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionStats {
    pub action: String,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_reward: f64,
    /// Rewards of the most recent outcomes, capped at 20
    pub recent_rewards: Vec<f64>,
    pub last_used: Option<DateTime<Utc>>,
}

impl ActionStats {
    /// Success rate; 0.5 for an action never seen
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.5;
        }
        self.success_count as f64 / self.total_count as f64
    }

    /// Mean reward over all outcomes
    pub fn average_reward(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.total_reward / self.total_count as f64
    }

    /// Success rate over the recent reward window (reward > 0 counts as
    /// success); 0.5 when empty
    pub fn recent_success_rate(&self) -> f64 {
        if self.recent_rewards.is_empty() {
            return 0.5;
        }
        let successes = self.recent_rewards.iter().filter(|r| **r > 0.0).count();
        successes as f64 / self.recent_rewards.len() as f64
    }
}

#[derive(Default)]
struct TrackerInner {
    stats: HashMap<String, ActionStats>,
    context_rewards: HashMap<(String, String), Vec<f64>>,
    outcomes: Vec<ActionOutcome>,
}

/// Tracks action performance globally and per context
#[derive(Default)]
pub struct ActionTracker {
    inner: Mutex<TrackerInner>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action outcome, updating global stats and the per-context
    /// reward window
    pub fn record(
        &self,
        action: &str,
        context_key: &str,
        reward: f64,
        success: bool,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> ActionOutcome {
        let outcome = ActionOutcome {
            id: Uuid::now_v7().to_string(),
            action: action.to_string(),
            context_key: context_key.to_string(),
            reward,
            success,
            timestamp: Utc::now(),
            metadata: metadata.unwrap_or_default(),
        };

        let mut inner = self.inner.lock().expect("tracker poisoned");

        let stats = inner
            .stats
            .entry(action.to_string())
            .or_insert_with(|| ActionStats {
                action: action.to_string(),
                ..Default::default()
            });
        stats.total_count += 1;
        stats.total_reward += reward;
        stats.last_used = Some(outcome.timestamp);
        if success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
        stats.recent_rewards.push(reward);
        if stats.recent_rewards.len() > RECENT_WINDOW_SIZE {
            stats.recent_rewards.remove(0);
        }

        let key = (context_key.to_string(), action.to_string());
        let rewards = inner.context_rewards.entry(key).or_default();
        rewards.push(reward);
        if rewards.len() > MAX_CONTEXT_REWARDS {
            rewards.remove(0);
        }

        inner.outcomes.push(outcome.clone());
        if inner.outcomes.len() > MAX_OUTCOMES {
            inner.outcomes.remove(0);
        }

        debug!(action, context_key, reward, success, "Recorded outcome");
        outcome
    }

    /// Success rate for an action; 0.5 when unknown
    pub fn get_success_rate(&self, action: &str) -> f64 {
        self.inner
            .lock()
            .expect("tracker poisoned")
            .stats
            .get(action)
            .map_or(0.5, |stats| stats.success_rate())
    }

    /// Full stats for an action, if tracked
    pub fn get_action_stats(&self, action: &str) -> Option<ActionStats> {
        self.inner
            .lock()
            .expect("tracker poisoned")
            .stats
            .get(action)
            .cloned()
    }

    /// Success rate for an action within a specific context; 0.5 when the
    /// pair has never been seen
    pub fn get_context_success_rate(&self, context_key: &str, action: &str) -> f64 {
        let inner = self.inner.lock().expect("tracker poisoned");
        let key = (context_key.to_string(), action.to_string());
        match inner.context_rewards.get(&key) {
            Some(rewards) if !rewards.is_empty() => {
                rewards.iter().filter(|r| **r > 0.0).count() as f64 / rewards.len() as f64
            }
            _ => 0.5,
        }
    }

    /// Best-performing action for a context, optionally restricted to
    /// `available_actions`
    pub fn get_best_action_for_context(
        &self,
        context_key: &str,
        available_actions: Option<&[String]>,
    ) -> Option<String> {
        let inner = self.inner.lock().expect("tracker poisoned");
        let mut best: Option<(String, f64)> = None;

        for ((ctx, action), rewards) in &inner.context_rewards {
            if ctx != context_key || rewards.is_empty() {
                continue;
            }
            if available_actions.is_some_and(|avail| !avail.contains(action)) {
                continue;
            }
            let rate = rewards.iter().filter(|r| **r > 0.0).count() as f64 / rewards.len() as f64;
            if best.as_ref().is_none_or(|(_, score)| rate > *score) {
                best = Some((action.clone(), rate));
            }
        }

        best.map(|(action, _)| action)
    }

    /// Actions ranked by success rate, globally or within a context
    pub fn get_action_ranking(
        &self,
        context_key: Option<&str>,
        available_actions: Option<&[String]>,
    ) -> Vec<(String, f64)> {
        let inner = self.inner.lock().expect("tracker poisoned");
        let mut rankings: Vec<(String, f64)> = match context_key {
            Some(ctx) => inner
                .context_rewards
                .iter()
                .filter(|((c, action), rewards)| {
                    c == ctx
                        && !rewards.is_empty()
                        && !available_actions.is_some_and(|avail| !avail.contains(action))
                })
                .map(|((_, action), rewards)| {
                    let rate =
                        rewards.iter().filter(|r| **r > 0.0).count() as f64 / rewards.len() as f64;
                    (action.clone(), rate)
                })
                .collect(),
            None => inner
                .stats
                .iter()
                .filter(|(action, _)| {
                    !available_actions.is_some_and(|avail| !avail.contains(*action))
                })
                .map(|(action, stats)| (action.clone(), stats.success_rate()))
                .collect(),
        };
        rankings.sort_by(|a, b| b.1.total_cmp(&a.1));
        rankings
    }

    /// All tracked stats keyed by action
    pub fn get_all_stats(&self) -> BTreeMap<String, ActionStats> {
        self.inner
            .lock()
            .expect("tracker poisoned")
            .stats
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Recent outcomes, newest last, optionally filtered
    pub fn get_recent_outcomes(
        &self,
        action: Option<&str>,
        context_key: Option<&str>,
        limit: usize,
    ) -> Vec<ActionOutcome> {
        let inner = self.inner.lock().expect("tracker poisoned");
        let filtered: Vec<ActionOutcome> = inner
            .outcomes
            .iter()
            .filter(|o| action.is_none_or(|a| o.action == a))
            .filter(|o| context_key.is_none_or(|c| o.context_key == c))
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    /// Actions with at least `min_observations` outcomes and a success rate
    /// below `threshold`, worst first
    pub fn get_failing_actions(
        &self,
        threshold: f64,
        min_observations: u64,
    ) -> Vec<(String, ActionStats)> {
        let inner = self.inner.lock().expect("tracker poisoned");
        let mut failing: Vec<(String, ActionStats)> = inner
            .stats
            .iter()
            .filter(|(_, stats)| {
                stats.total_count >= min_observations && stats.success_rate() < threshold
            })
            .map(|(action, stats)| (action.clone(), stats.clone()))
            .collect();
        failing.sort_by(|a, b| a.1.success_rate().total_cmp(&b.1.success_rate()));
        failing
    }

    /// Drop all tracked data
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("tracker poisoned");
        inner.stats.clear();
        inner.context_rewards.clear();
        inner.outcomes.clear();
        debug!("ActionTracker cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_action_is_neutral() {
        let tracker = ActionTracker::new();
        assert_eq!(tracker.get_success_rate("never_seen"), 0.5);
        assert_eq!(tracker.get_context_success_rate("ctx", "never_seen"), 0.5);
        assert!(tracker.get_action_stats("never_seen").is_none());
    }

    #[test]
    fn test_record_updates_counters() {
        let tracker = ActionTracker::new();
        tracker.record("post", "ctx1", 0.8, true, None);
        tracker.record("post", "ctx1", -0.6, false, None);
        tracker.record("post", "ctx2", 0.4, true, None);

        let stats = tracker.get_action_stats("post").unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.total_count, stats.success_count + stats.failure_count);
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.average_reward() - 0.2).abs() < 1e-9);
        assert!(stats.last_used.is_some());
    }

    #[test]
    fn test_recent_rewards_window_capped() {
        let tracker = ActionTracker::new();
        for i in 0..30 {
            tracker.record("spam", "ctx", if i < 15 { -1.0 } else { 1.0 }, i >= 15, None);
        }

        let stats = tracker.get_action_stats("spam").unwrap();
        assert_eq!(stats.recent_rewards.len(), 20);
        // Last 20 rewards: 5 failures then 15 successes
        assert!((stats.recent_success_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_context_rewards_capped_at_100() {
        let tracker = ActionTracker::new();
        for _ in 0..150 {
            tracker.record("post", "ctx", 1.0, true, None);
        }
        let inner = tracker.inner.lock().unwrap();
        let rewards = &inner.context_rewards[&("ctx".to_string(), "post".to_string())];
        assert_eq!(rewards.len(), 100);
    }

    #[test]
    fn test_context_success_rate_separate_from_global() {
        let tracker = ActionTracker::new();
        tracker.record("post", "good_ctx", 1.0, true, None);
        tracker.record("post", "bad_ctx", -1.0, false, None);

        assert_eq!(tracker.get_context_success_rate("good_ctx", "post"), 1.0);
        assert_eq!(tracker.get_context_success_rate("bad_ctx", "post"), 0.0);
        assert_eq!(tracker.get_success_rate("post"), 0.5);
    }

    #[test]
    fn test_best_action_for_context() {
        let tracker = ActionTracker::new();
        tracker.record("search", "ctx", 1.0, true, None);
        tracker.record("search", "ctx", 1.0, true, None);
        tracker.record("post", "ctx", -1.0, false, None);

        assert_eq!(
            tracker.get_best_action_for_context("ctx", None),
            Some("search".to_string())
        );
        // Restricting to post returns post despite the worse rate
        assert_eq!(
            tracker.get_best_action_for_context("ctx", Some(&["post".to_string()])),
            Some("post".to_string())
        );
        assert_eq!(tracker.get_best_action_for_context("other", None), None);
    }

    #[test]
    fn test_failing_actions_sorted_worst_first() {
        let tracker = ActionTracker::new();
        for _ in 0..6 {
            tracker.record("bad", "ctx", -1.0, false, None);
        }
        for i in 0..10 {
            tracker.record("meh", "ctx", if i < 2 { 1.0 } else { -1.0 }, i < 2, None);
        }
        // Too few observations to count
        tracker.record("fresh", "ctx", -1.0, false, None);
        // Healthy action
        for _ in 0..10 {
            tracker.record("good", "ctx", 1.0, true, None);
        }

        let failing = tracker.get_failing_actions(0.3, 5);
        let names: Vec<&str> = failing.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["bad", "meh"]);
    }

    #[test]
    fn test_recent_outcomes_filtering() {
        let tracker = ActionTracker::new();
        tracker.record("a", "ctx1", 1.0, true, None);
        tracker.record("b", "ctx1", 1.0, true, None);
        tracker.record("a", "ctx2", -1.0, false, None);

        assert_eq!(tracker.get_recent_outcomes(Some("a"), None, 10).len(), 2);
        assert_eq!(tracker.get_recent_outcomes(None, Some("ctx1"), 10).len(), 2);
        assert_eq!(
            tracker
                .get_recent_outcomes(Some("a"), Some("ctx2"), 10)
                .len(),
            1
        );
        assert_eq!(tracker.get_recent_outcomes(None, None, 2).len(), 2);
    }

    #[test]
    fn test_ranking() {
        let tracker = ActionTracker::new();
        for _ in 0..4 {
            tracker.record("good", "ctx", 1.0, true, None);
        }
        for _ in 0..4 {
            tracker.record("bad", "ctx", -1.0, false, None);
        }

        let global = tracker.get_action_ranking(None, None);
        assert_eq!(global[0].0, "good");
        assert_eq!(global[1].0, "bad");

        let contextual = tracker.get_action_ranking(Some("ctx"), None);
        assert_eq!(contextual[0].0, "good");
    }

    #[test]
    fn test_clear() {
        let tracker = ActionTracker::new();
        tracker.record("a", "ctx", 1.0, true, None);
        tracker.clear();
        assert!(tracker.get_all_stats().is_empty());
        assert_eq!(tracker.get_success_rate("a"), 0.5);
    }
}
