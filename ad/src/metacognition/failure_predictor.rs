//! Failure predictor - pre-action risk estimation
//!
//! Combines historical success rates, recent failures, rate-limit tracking,
//! and context warning flags into a failure probability before an action is
//! executed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::learning::{ActionOutcome, ActionTracker};

/// Probability at or above which a prediction is high risk
const HIGH_FAILURE_THRESHOLD: f64 = 0.7;
/// Minimum observations before history contributes
const MIN_OBSERVATIONS: u64 = 3;
/// Window for recent-failure analysis
const RECENT_WINDOW_HOURS: i64 = 24;
/// Cap on retained failures
const MAX_RECENT_FAILURES: usize = 100;

/// Categories of predicted failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimit,
    Timeout,
    AuthError,
    ResourceUnavailable,
    SimilarFailure,
    LowSuccessRate,
    PrerequisiteMissing,
    ContextMismatch,
    Unknown,
}

/// A prediction of potential failure for one action
#[derive(Debug, Clone, Serialize)]
pub struct FailurePrediction {
    pub action: String,
    /// Probability in [0, 1]
    pub probability: f64,
    pub reasons: Vec<FailureReason>,
    pub reason_details: Vec<String>,
    pub suggested_alternatives: Vec<String>,
    pub confidence: f64,
    pub should_proceed: bool,
    pub wait_seconds: f64,
}

impl FailurePrediction {
    /// High failure risk: probable and confidently predicted
    pub fn is_high_risk(&self) -> bool {
        self.probability >= HIGH_FAILURE_THRESHOLD && self.confidence >= 0.5
    }

    /// Medium failure risk
    pub fn is_medium_risk(&self) -> bool {
        (0.4..HIGH_FAILURE_THRESHOLD).contains(&self.probability) && self.confidence >= 0.4
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    used: u64,
    max: u64,
    reset_time: Option<DateTime<Utc>>,
}

/// Predictor statistics
#[derive(Debug, Clone, Serialize)]
pub struct FailurePredictorStats {
    pub rate_limits_tracked: usize,
    pub recent_failures: usize,
    pub has_tracker: bool,
    pub actions_with_limits: Vec<String>,
}

/// Predicts impending failures from history and context
#[derive(Default)]
pub struct FailurePredictor {
    tracker: Mutex<Option<Arc<ActionTracker>>>,
    rate_limits: Mutex<HashMap<String, RateLimitEntry>>,
    recent_failures: Mutex<Vec<ActionOutcome>>,
}

impl FailurePredictor {
    pub fn new(tracker: Option<Arc<ActionTracker>>) -> Self {
        debug!("FailurePredictor initialized");
        Self {
            tracker: Mutex::new(tracker),
            rate_limits: Mutex::new(HashMap::new()),
            recent_failures: Mutex::new(Vec::new()),
        }
    }

    /// Attach (or replace) the action tracker
    pub fn set_tracker(&self, tracker: Arc<ActionTracker>) {
        *self.tracker.lock().expect("tracker slot poisoned") = Some(tracker);
    }

    /// Predict failure probability for an action in a context
    pub fn predict(&self, action: &str, context: &BTreeMap<String, Value>) -> FailurePrediction {
        let mut reasons = Vec::new();
        let mut reason_details = Vec::new();
        let mut probabilities = Vec::new();
        let mut alternatives = Vec::new();

        let tracker = self.tracker.lock().expect("tracker slot poisoned").clone();

        // 1. Historical low success rate
        if let Some(tracker) = &tracker {
            if let Some(stats) = tracker.get_action_stats(action) {
                let success_rate = stats.success_rate();
                if stats.total_count >= MIN_OBSERVATIONS && success_rate < 0.3 {
                    reasons.push(FailureReason::LowSuccessRate);
                    reason_details.push(format!(
                        "Low historical success rate: {:.0}% over {} attempts",
                        success_rate * 100.0,
                        stats.total_count
                    ));
                    probabilities.push(1.0 - success_rate);
                }
            }
        }

        // 2. Recent failures of this action
        let recent_prob = self.check_recent_failures(action, tracker.as_deref());
        if recent_prob > 0.5 {
            reasons.push(FailureReason::SimilarFailure);
            reason_details.push(format!(
                "Similar action failed recently (pattern probability: {:.0}%)",
                recent_prob * 100.0
            ));
            probabilities.push(recent_prob);
        }

        // 3. Rate limit status
        let rate_prob = self.check_rate_limit(action, context);
        if rate_prob > 0.3 {
            reasons.push(FailureReason::RateLimit);
            let detail = {
                let limits = self.rate_limits.lock().expect("rate limits poisoned");
                match limits.get(action) {
                    Some(entry) if entry.max > 0 => {
                        format!("Approaching rate limit ({}/{})", entry.used, entry.max)
                    }
                    _ => "Rate limiting likely".to_string(),
                }
            };
            reason_details.push(detail);
            probabilities.push(rate_prob);
            alternatives = rate_limit_alternatives(action);
        }

        // 4. Context warning flags
        let context_prob = analyze_context(context);
        if context_prob > 0.3 {
            reasons.push(FailureReason::ContextMismatch);
            reason_details.push("Context suggests potential issues".to_string());
            probabilities.push(context_prob);
        }

        // Weighted average dominated by the worst signal
        let probability = if probabilities.is_empty() {
            0.0
        } else {
            let max = probabilities.iter().copied().fold(0.0f64, f64::max);
            let mean = probabilities.iter().sum::<f64>() / probabilities.len() as f64;
            (0.6 * max + 0.4 * mean).min(1.0)
        };

        let confidence = self.calculate_confidence(action, tracker.as_deref());
        let wait_seconds = self.wait_time(action, &reasons);

        FailurePrediction {
            action: action.to_string(),
            probability,
            reasons,
            reason_details,
            suggested_alternatives: alternatives,
            confidence,
            should_proceed: probability < HIGH_FAILURE_THRESHOLD,
            wait_seconds,
        }
    }

    fn check_recent_failures(&self, action: &str, tracker: Option<&ActionTracker>) -> f64 {
        let Some(tracker) = tracker else {
            return 0.0;
        };
        let recent = tracker.get_recent_outcomes(Some(action), None, 10);
        if recent.is_empty() {
            return 0.0;
        }

        let cutoff = Utc::now() - Duration::hours(RECENT_WINDOW_HOURS);
        let window: Vec<&ActionOutcome> =
            recent.iter().filter(|o| o.timestamp >= cutoff).collect();
        if window.is_empty() {
            return 0.0;
        }

        let failures = window.iter().filter(|o| !o.success).count();
        failures as f64 / window.len() as f64
    }

    fn check_rate_limit(&self, action: &str, context: &BTreeMap<String, Value>) -> f64 {
        let mut limits = self.rate_limits.lock().expect("rate limits poisoned");
        if let Some(entry) = limits.get(action) {
            // A passed reset clears the entry
            if entry.reset_time.is_some_and(|reset| Utc::now() > reset) {
                limits.remove(action);
                return 0.0;
            }
            if entry.max > 0 {
                let usage = entry.used as f64 / entry.max as f64;
                if usage >= 0.9 {
                    return 0.9;
                } else if usage >= 0.7 {
                    return 0.5;
                } else if usage >= 0.5 {
                    return 0.2;
                }
            }
        }
        drop(limits);

        if context
            .get("rate_limit_warning")
            .is_some_and(|v| v.as_bool().unwrap_or(false))
        {
            return 0.7;
        }
        0.0
    }

    fn calculate_confidence(&self, action: &str, tracker: Option<&ActionTracker>) -> f64 {
        let Some(tracker) = tracker else {
            return 0.3;
        };
        let Some(stats) = tracker.get_action_stats(action) else {
            return 0.3;
        };
        match stats.total_count {
            n if n >= 20 => 0.9,
            n if n >= 10 => 0.7,
            n if n >= 5 => 0.5,
            _ => 0.3,
        }
    }

    fn wait_time(&self, action: &str, reasons: &[FailureReason]) -> f64 {
        if reasons.contains(&FailureReason::RateLimit) {
            let limits = self.rate_limits.lock().expect("rate limits poisoned");
            if let Some(reset) = limits.get(action).and_then(|e| e.reset_time) {
                let wait = (reset - Utc::now()).num_milliseconds() as f64 / 1000.0;
                return wait.max(0.0);
            }
            return 60.0;
        }
        if reasons.contains(&FailureReason::Timeout) {
            return 30.0;
        }
        if reasons.contains(&FailureReason::SimilarFailure) {
            return 10.0;
        }
        0.0
    }

    /// Record rate-limit usage for an action
    pub fn record_rate_limit(
        &self,
        action: &str,
        used: u64,
        max: u64,
        reset_time: Option<DateTime<Utc>>,
    ) {
        self.rate_limits.lock().expect("rate limits poisoned").insert(
            action.to_string(),
            RateLimitEntry {
                used,
                max,
                reset_time,
            },
        );
    }

    /// Record a failed outcome for pattern analysis
    pub fn record_failure(&self, outcome: ActionOutcome) {
        if outcome.success {
            return;
        }
        let mut failures = self.recent_failures.lock().expect("failures poisoned");
        failures.push(outcome);
        if failures.len() > MAX_RECENT_FAILURES {
            failures.remove(0);
        }
    }

    /// Drop rate-limit and failure tracking
    pub fn clear(&self) {
        self.rate_limits.lock().expect("rate limits poisoned").clear();
        self.recent_failures.lock().expect("failures poisoned").clear();
        debug!("FailurePredictor cleared");
    }

    /// Predictor statistics
    pub fn get_statistics(&self) -> FailurePredictorStats {
        let limits = self.rate_limits.lock().expect("rate limits poisoned");
        FailurePredictorStats {
            rate_limits_tracked: limits.len(),
            recent_failures: self.recent_failures.lock().expect("failures poisoned").len(),
            has_tracker: self.tracker.lock().expect("tracker slot poisoned").is_some(),
            actions_with_limits: limits.keys().cloned().collect(),
        }
    }
}

/// Builtin fallbacks for known rate-limited actions
fn rate_limit_alternatives(action: &str) -> Vec<String> {
    let alternatives: &[&str] = match action {
        "search_tavily" => &["ask_perplexity"],
        "ask_perplexity" => &["search_tavily"],
        "post_tweet" => &["send_telegram_message", "send_slack_message"],
        "send_discord_message" => &["send_telegram_message", "send_slack_message"],
        _ => &[],
    };
    alternatives.iter().map(|s| s.to_string()).collect()
}

/// Fraction of warning flags present in the context
fn analyze_context(context: &BTreeMap<String, Value>) -> f64 {
    let truthy = |key: &str| {
        context.get(key).is_some_and(|v| match v {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
    };

    let mut warnings = 0;
    if truthy("error_state") || truthy("last_error") {
        warnings += 1;
    }
    if context
        .get("retry_count")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        > 0
    {
        warnings += 1;
    }
    if truthy("slow_response") || truthy("timeout_warning") {
        warnings += 1;
    }
    if truthy("low_resources") || truthy("memory_warning") {
        warnings += 1;
    }
    warnings as f64 / 4.0
}
