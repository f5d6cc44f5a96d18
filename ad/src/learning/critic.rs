//! Self-critic - rule-based failure analysis
//!
//! Classifies failed actions against a set of keyword rule families and
//! produces structured critiques and cross-failure improvement suggestions.
//! A language-model collaborator can be plugged in for richer critiques; the
//! rules remain the fallback when it fails.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cap on critiques retained in memory
const MAX_RECENT_CRITIQUES: usize = 100;

/// Severity of a critique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CritiqueLevel {
    /// Minor observations
    Info,
    /// Potential issues
    Warning,
    /// Clear problems
    Error,
    /// Major failures
    Critical,
}

/// Result of analyzing one failed action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    pub action: String,
    pub context_summary: String,
    pub outcome_summary: String,

    pub failure_reason: String,
    pub what_went_wrong: String,
    pub better_approach: String,
    pub pattern_to_avoid: String,
    pub lesson_learned: String,

    pub level: CritiqueLevel,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// "rule_based", "llm", or "fallback"
    pub source: String,
}

/// A suggestion derived from repeated failure patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSuggestion {
    pub id: String,
    /// The identified pattern
    pub pattern: String,
    /// What to do differently
    pub suggestion: String,
    /// 1 = highest priority
    pub priority: u8,
    pub affected_actions: Vec<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// A failed action queued for batch pattern analysis
#[derive(Debug, Clone)]
pub struct FailedAction {
    pub action: String,
    pub context: BTreeMap<String, Value>,
    pub outcome: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FailedAction {
    pub fn new(action: &str, outcome: Option<&str>, error_message: Option<&str>) -> Self {
        Self {
            action: action.to_string(),
            context: BTreeMap::new(),
            outcome: outcome.map(str::to_string),
            error_message: error_message.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// Optional language-model seam for critiques
#[async_trait]
pub trait CritiqueModel: Send + Sync {
    async fn critique(
        &self,
        action: &str,
        context_summary: &str,
        outcome_summary: &str,
        error_message: Option<&str>,
    ) -> eyre::Result<Critique>;
}

struct FailureRule {
    key: &'static str,
    keywords: &'static [&'static str],
    reason: &'static str,
    better_approach: &'static str,
    pattern: &'static str,
}

/// Keyword rule families for common failure classes
const FAILURE_RULES: &[FailureRule] = &[
    FailureRule {
        key: "rate_limit",
        keywords: &["rate limit", "too many requests", "429", "throttle"],
        reason: "API rate limiting exceeded",
        better_approach: "Implement backoff, use alternative API, or cache results",
        pattern: "Excessive API calls without rate limiting",
    },
    FailureRule {
        key: "timeout",
        keywords: &["timeout", "timed out", "deadline exceeded"],
        reason: "Operation timed out",
        better_approach: "Increase timeout, use async processing, or break into smaller tasks",
        pattern: "Long-running operations without timeout handling",
    },
    FailureRule {
        key: "auth_error",
        keywords: &["unauthorized", "forbidden", "401", "403", "permission"],
        reason: "Authentication or authorization failed",
        better_approach: "Verify credentials, check permissions, refresh tokens",
        pattern: "Attempting actions without proper authorization",
    },
    FailureRule {
        key: "not_found",
        keywords: &["not found", "404", "does not exist", "missing"],
        reason: "Resource not found",
        better_approach: "Validate resource existence before action, handle missing gracefully",
        pattern: "Assuming resources exist without verification",
    },
    FailureRule {
        key: "invalid_input",
        keywords: &["invalid", "bad request", "400", "validation", "malformed"],
        reason: "Invalid input provided",
        better_approach: "Validate inputs before sending, use schemas",
        pattern: "Sending malformed or invalid data",
    },
    FailureRule {
        key: "connection_error",
        keywords: &["connection", "network", "unreachable", "refused"],
        reason: "Network connection failed",
        better_approach: "Implement retry logic, use fallback services",
        pattern: "Not handling network failures gracefully",
    },
];

fn match_rule(text: &str) -> Option<&'static FailureRule> {
    FAILURE_RULES
        .iter()
        .find(|rule| rule.keywords.iter().any(|kw| text.contains(kw)))
}

/// Analyzes failures and accumulates critiques and suggestions
#[derive(Default)]
pub struct SelfCritic {
    model: Option<Arc<dyn CritiqueModel>>,
    critiques: Mutex<Vec<Critique>>,
    suggestions: Mutex<Vec<ImprovementSuggestion>>,
}

impl SelfCritic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a language-model collaborator; rules remain the fallback
    pub fn with_model(model: Arc<dyn CritiqueModel>) -> Self {
        Self {
            model: Some(model),
            ..Default::default()
        }
    }

    /// Analyze a failed action
    pub async fn critique(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
        outcome: Option<&str>,
        error_message: Option<&str>,
    ) -> Critique {
        let context_summary = summarize_context(context);
        let outcome_summary = summarize_outcome(outcome, error_message);

        if let Some(model) = &self.model {
            match model
                .critique(action, &context_summary, &outcome_summary, error_message)
                .await
            {
                Ok(critique) => {
                    self.remember(critique.clone());
                    return critique;
                }
                Err(e) => {
                    warn!(error = %e, "Model critique failed, using rule-based");
                }
            }
        }

        let critique = rule_based_critique(action, &context_summary, &outcome_summary, error_message);
        self.remember(critique.clone());
        critique
    }

    fn remember(&self, critique: Critique) {
        let mut critiques = self.critiques.lock().expect("critiques poisoned");
        critiques.push(critique);
        if critiques.len() > MAX_RECENT_CRITIQUES {
            critiques.remove(0);
        }
    }

    /// Analyze patterns across multiple failures, producing per-action and
    /// system-wide suggestions sorted by priority
    pub fn generate_improvement_suggestions(
        &self,
        recent_failures: &[FailedAction],
    ) -> Vec<ImprovementSuggestion> {
        if recent_failures.is_empty() {
            return Vec::new();
        }

        let mut suggestions = Vec::new();

        // Group failures by action
        let mut by_action: BTreeMap<&str, Vec<&FailedAction>> = BTreeMap::new();
        for failure in recent_failures {
            by_action.entry(&failure.action).or_default().push(failure);
        }

        for (action, failures) in &by_action {
            if failures.len() >= 2 {
                suggestions.push(analyze_action_failures(action, failures));
            }
        }

        suggestions.extend(analyze_cross_action_patterns(recent_failures));

        suggestions.sort_by_key(|s| s.priority);
        self.suggestions
            .lock()
            .expect("suggestions poisoned")
            .extend(suggestions.iter().cloned());
        suggestions
    }

    /// Recent critiques, oldest first
    pub fn get_recent_critiques(&self, limit: usize) -> Vec<Critique> {
        let critiques = self.critiques.lock().expect("critiques poisoned");
        let start = critiques.len().saturating_sub(limit);
        critiques[start..].to_vec()
    }

    /// All accumulated suggestions
    pub fn get_suggestions(&self) -> Vec<ImprovementSuggestion> {
        self.suggestions.lock().expect("suggestions poisoned").clone()
    }

    /// Drop all critiques and suggestions
    pub fn clear(&self) {
        self.critiques.lock().expect("critiques poisoned").clear();
        self.suggestions.lock().expect("suggestions poisoned").clear();
        debug!("SelfCritic cleared");
    }
}

fn rule_based_critique(
    action: &str,
    context_summary: &str,
    outcome_summary: &str,
    error_message: Option<&str>,
) -> Critique {
    let text = format!("{} {}", outcome_summary, error_message.unwrap_or("")).to_lowercase();

    if let Some(rule) = match_rule(&text) {
        return Critique {
            id: Uuid::now_v7().to_string(),
            action: action.to_string(),
            context_summary: context_summary.to_string(),
            outcome_summary: outcome_summary.to_string(),
            failure_reason: rule.reason.to_string(),
            what_went_wrong: format!("Action '{action}' failed: {}", rule.reason),
            better_approach: rule.better_approach.to_string(),
            pattern_to_avoid: rule.pattern.to_string(),
            lesson_learned: format!("When using {action}: {}", rule.better_approach),
            level: CritiqueLevel::Error,
            confidence: 0.6,
            created_at: Utc::now(),
            source: "rule_based".to_string(),
        };
    }

    // Generic fallback when no rule matches
    Critique {
        id: Uuid::now_v7().to_string(),
        action: action.to_string(),
        context_summary: context_summary.to_string(),
        outcome_summary: outcome_summary.to_string(),
        failure_reason: "Unknown failure reason".to_string(),
        what_went_wrong: format!("Action '{action}' failed unexpectedly"),
        better_approach: "Review action parameters and preconditions".to_string(),
        pattern_to_avoid: "Unknown - requires further analysis".to_string(),
        lesson_learned: format!("Action '{action}' may be unreliable in this context"),
        level: CritiqueLevel::Warning,
        confidence: 0.4,
        created_at: Utc::now(),
        source: "fallback".to_string(),
    }
}

fn analyze_action_failures(action: &str, failures: &[&FailedAction]) -> ImprovementSuggestion {
    // Count failures per rule family
    let mut rule_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for failure in failures {
        if let Some(error) = &failure.error_message {
            if let Some(rule) = match_rule(&error.to_lowercase()) {
                *rule_counts.entry(rule.key).or_insert(0) += 1;
            }
        }
    }

    if let Some((&rule_key, &count)) = rule_counts.iter().max_by_key(|(_, count)| **count) {
        let rule = FAILURE_RULES
            .iter()
            .find(|r| r.key == rule_key)
            .expect("rule key from matched rules");
        return ImprovementSuggestion {
            id: Uuid::now_v7().to_string(),
            pattern: format!("Repeated {rule_key} failures in {action}"),
            suggestion: rule.better_approach.to_string(),
            priority: if count >= 3 { 1 } else { 2 },
            affected_actions: vec![action.to_string()],
            confidence: (0.5 + 0.1 * count as f64).min(0.9),
            created_at: Utc::now(),
        };
    }

    // Unexplained failures still warrant a generic suggestion
    ImprovementSuggestion {
        id: Uuid::now_v7().to_string(),
        pattern: format!("Frequent failures in {action} ({} times)", failures.len()),
        suggestion: format!("Review {action} implementation and add better error handling"),
        priority: 3,
        affected_actions: vec![action.to_string()],
        confidence: 0.5,
        created_at: Utc::now(),
    }
}

fn analyze_cross_action_patterns(failures: &[FailedAction]) -> Vec<ImprovementSuggestion> {
    // Rule family -> distinct actions it touched
    let mut by_rule: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for failure in failures {
        if let Some(error) = &failure.error_message {
            if let Some(rule) = match_rule(&error.to_lowercase()) {
                let actions = by_rule.entry(rule.key).or_default();
                if !actions.contains(&failure.action) {
                    actions.push(failure.action.clone());
                }
            }
        }
    }

    by_rule
        .into_iter()
        .filter(|(_, actions)| actions.len() >= 2)
        .map(|(rule_key, affected_actions)| {
            let rule = FAILURE_RULES
                .iter()
                .find(|r| r.key == rule_key)
                .expect("rule key from matched rules");
            ImprovementSuggestion {
                id: Uuid::now_v7().to_string(),
                pattern: format!("System-wide {rule_key} issues"),
                suggestion: format!(
                    "Address {} across all actions: {}",
                    rule.reason, rule.better_approach
                ),
                priority: 1,
                affected_actions,
                confidence: 0.8,
                created_at: Utc::now(),
            }
        })
        .collect()
}

fn summarize_context(context: &BTreeMap<String, Value>) -> String {
    if context.is_empty() {
        return "No context provided".to_string();
    }
    let parts: Vec<String> = ["goal", "task", "action", "state", "query"]
        .iter()
        .filter_map(|key| context.get(*key).map(|v| format!("{key}: {v}")))
        .take(3)
        .collect();
    if parts.is_empty() {
        let mut raw = serde_json::to_string(context).unwrap_or_default();
        raw.truncate(200);
        raw
    } else {
        parts.join("; ")
    }
}

fn summarize_outcome(outcome: Option<&str>, error_message: Option<&str>) -> String {
    if let Some(error) = error_message {
        return format!("Error: {error}");
    }
    match outcome {
        Some(outcome) => {
            let mut summary = outcome.to_string();
            summary.truncate(200);
            summary
        }
        None => "No result returned".to_string(),
    }
}
