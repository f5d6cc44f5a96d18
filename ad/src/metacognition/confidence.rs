//! Confidence estimator - weighted multi-factor confidence in the current
//! approach
//!
//! Low overall confidence triggers a human-handoff intervention.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Factors that feed the confidence estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceFactor {
    /// Is the goal well-defined?
    GoalClarity,
    /// Have we done this before?
    MemorySupport,
    /// Do we have the needed tools?
    ToolAvailability,
    /// Is this situation known?
    ContextFamiliarity,
    /// Is the plan complete?
    PlanCompleteness,
    /// Past success rate
    SuccessHistory,
    /// Are we in an error state?
    ErrorState,
}

impl ConfidenceFactor {
    fn weight(self) -> f64 {
        match self {
            ConfidenceFactor::GoalClarity => 0.25,
            ConfidenceFactor::MemorySupport => 0.15,
            ConfidenceFactor::ToolAvailability => 0.15,
            ConfidenceFactor::ContextFamiliarity => 0.15,
            ConfidenceFactor::PlanCompleteness => 0.10,
            ConfidenceFactor::SuccessHistory => 0.15,
            ConfidenceFactor::ErrorState => 0.05,
        }
    }

    fn help_request(self) -> &'static str {
        match self {
            ConfidenceFactor::GoalClarity => {
                "Human clarification on the exact goal and success criteria"
            }
            ConfidenceFactor::MemorySupport => {
                "Human guidance on how to approach this unfamiliar task"
            }
            ConfidenceFactor::ToolAvailability => "Human help identifying the right tools to use",
            ConfidenceFactor::ContextFamiliarity => "Human context about this situation",
            ConfidenceFactor::PlanCompleteness => "Human input on the overall approach",
            ConfidenceFactor::SuccessHistory => "Human feedback on what's going wrong",
            ConfidenceFactor::ErrorState => "Human assistance recovering from errors",
        }
    }
}

/// Inputs to an estimate; every field is optional
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs<'a> {
    pub goal: Option<&'a str>,
    pub plan: Option<&'a BTreeMap<String, Value>>,
    pub context: Option<&'a BTreeMap<String, Value>>,
    pub available_tools: Option<&'a [String]>,
    /// Count of relevant memory matches, when a lookup ran
    pub memory_matches: Option<usize>,
    pub success_rate: f64,
    pub error_state: bool,
}

/// The estimate produced for one action
#[derive(Debug, Clone, Serialize)]
pub struct ConfidenceEstimate {
    /// Overall confidence in [0, 1]
    pub level: f64,
    pub factors: BTreeMap<ConfidenceFactor, f64>,
    pub uncertain_aspects: Vec<String>,
    /// Help request text, present when help should be requested
    pub would_benefit_from: Option<String>,
    pub should_request_help: bool,
    pub explanation: String,
}

impl ConfidenceEstimate {
    pub fn is_low(&self) -> bool {
        self.level < 0.4
    }

    pub fn is_medium(&self) -> bool {
        (0.4..0.7).contains(&self.level)
    }

    pub fn is_high(&self) -> bool {
        self.level >= 0.7
    }

    /// The factor dragging confidence down the most
    pub fn weakest_factor(&self) -> Option<ConfidenceFactor> {
        self.factors
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(factor, _)| *factor)
    }
}

/// Confidence below which help is requested
const HELP_THRESHOLD: f64 = 0.3;

const QUESTION_WORDS: &[&str] = &["what", "how", "why", "when", "where", "which"];
const ACTION_VERBS: &[&str] = &["create", "find", "analyze", "send", "search", "post", "get"];
const INTENT_WORDS: &[&str] = &["specific", "exactly", "must", "should"];

/// Estimates the agent's confidence in its current approach
#[derive(Default)]
pub struct ConfidenceEstimator;

impl ConfidenceEstimator {
    pub fn new() -> Self {
        debug!("ConfidenceEstimator initialized");
        Self
    }

    /// Full weighted estimate over all seven factors
    pub fn estimate(&self, inputs: &ConfidenceInputs<'_>) -> ConfidenceEstimate {
        let mut factors = BTreeMap::new();
        let mut uncertain = Vec::new();

        let goal_score = assess_goal_clarity(inputs.goal);
        factors.insert(ConfidenceFactor::GoalClarity, goal_score);
        if goal_score < 0.5 {
            uncertain.push("Goal is unclear or undefined".to_string());
        }

        let memory_score = assess_memory_support(inputs.memory_matches);
        factors.insert(ConfidenceFactor::MemorySupport, memory_score);
        if memory_score < 0.5 {
            uncertain.push("No similar past experience found".to_string());
        }

        let tool_score = assess_tool_availability(inputs.available_tools, inputs.plan);
        factors.insert(ConfidenceFactor::ToolAvailability, tool_score);
        if tool_score < 0.5 {
            uncertain.push("Required tools may not be available".to_string());
        }

        let context_score = assess_context_familiarity(inputs.context, inputs.memory_matches);
        factors.insert(ConfidenceFactor::ContextFamiliarity, context_score);
        if context_score < 0.5 {
            uncertain.push("Unfamiliar situation".to_string());
        }

        let plan_score = assess_plan_completeness(inputs.plan);
        factors.insert(ConfidenceFactor::PlanCompleteness, plan_score);
        if plan_score < 0.5 {
            uncertain.push("Plan may be incomplete".to_string());
        }

        factors.insert(ConfidenceFactor::SuccessHistory, inputs.success_rate);
        if inputs.success_rate < 0.5 {
            uncertain.push("Recent performance has been poor".to_string());
        }

        let error_score = if inputs.error_state { 0.2 } else { 1.0 };
        factors.insert(ConfidenceFactor::ErrorState, error_score);
        if inputs.error_state {
            uncertain.push("Currently in error recovery mode".to_string());
        }

        let level = overall(&factors);
        let should_request_help = level < HELP_THRESHOLD;

        let would_benefit_from = should_request_help
            .then(|| {
                factors
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(factor, _)| factor.help_request().to_string())
            })
            .flatten();

        let explanation = explain(level, &uncertain);

        ConfidenceEstimate {
            level,
            factors,
            uncertain_aspects: uncertain,
            would_benefit_from,
            should_request_help,
            explanation,
        }
    }

    /// Cheap estimate without the full factor analysis
    pub fn quick_estimate(
        &self,
        goal: Option<&str>,
        has_memories: bool,
        success_rate: f64,
        error_state: bool,
    ) -> f64 {
        let mut score = 0.5;
        if goal.is_some_and(|g| g.len() > 10) {
            score += 0.15;
        }
        if has_memories {
            score += 0.15;
        }
        score += (success_rate - 0.5) * 0.2;
        if error_state {
            score -= 0.2;
        }
        score.clamp(0.0, 1.0)
    }
}

fn assess_goal_clarity(goal: Option<&str>) -> f64 {
    let Some(goal) = goal else {
        return 0.2;
    };
    if goal.is_empty() {
        return 0.2;
    }

    let mut score: f64 = 0.5;
    if (20..=200).contains(&goal.len()) {
        score += 0.2;
    }

    let lower = goal.to_lowercase();
    if QUESTION_WORDS.iter().any(|w| lower.contains(w)) {
        score -= 0.1;
    }
    if ACTION_VERBS.iter().any(|w| lower.contains(w)) {
        score += 0.2;
    }
    if INTENT_WORDS.iter().any(|w| lower.contains(w)) {
        score += 0.1;
    }

    score.clamp(0.0, 1.0)
}

fn assess_memory_support(memory_matches: Option<usize>) -> f64 {
    match memory_matches.unwrap_or(0) {
        n if n >= 5 => 0.9,
        n if n >= 3 => 0.7,
        n if n >= 1 => 0.5,
        _ => 0.3,
    }
}

fn assess_tool_availability(
    available_tools: Option<&[String]>,
    plan: Option<&BTreeMap<String, Value>>,
) -> f64 {
    let Some(available) = available_tools else {
        return 0.5;
    };
    let Some(plan) = plan else {
        return 0.7;
    };

    let required: Vec<&str> = plan
        .get("required_tools")
        .and_then(Value::as_array)
        .map(|tools| tools.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if required.is_empty() {
        return 0.8;
    }

    let covered = required
        .iter()
        .filter(|tool| available.iter().any(|a| a == *tool))
        .count();
    covered as f64 / required.len() as f64
}

fn assess_context_familiarity(
    context: Option<&BTreeMap<String, Value>>,
    memory_matches: Option<usize>,
) -> f64 {
    let Some(context) = context else {
        return 0.5;
    };

    let mut score = 0.5;
    if memory_matches.unwrap_or(0) > 0 {
        score += 0.2;
    }
    let known_present = ["goal", "task_type", "action", "environment"]
        .iter()
        .filter(|key| context.contains_key(**key))
        .count();
    score += known_present as f64 * 0.1;
    score.min(1.0)
}

fn assess_plan_completeness(plan: Option<&BTreeMap<String, Value>>) -> f64 {
    let Some(plan) = plan else {
        return 0.3;
    };

    let mut score: f64 = 0.5;
    if plan.get("steps").is_some() {
        score += 0.2;
    }
    if plan.contains_key("goal") || plan.contains_key("objective") {
        score += 0.1;
    }
    if plan.contains_key("success_criteria") {
        score += 0.1;
    }
    if plan.contains_key("fallback") || plan.contains_key("alternatives") {
        score += 0.1;
    }
    score.min(1.0)
}

fn overall(factors: &BTreeMap<ConfidenceFactor, f64>) -> f64 {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for (factor, score) in factors {
        weighted += score * factor.weight();
        total_weight += factor.weight();
    }
    if total_weight == 0.0 {
        return 0.5;
    }
    weighted / total_weight
}

fn explain(level: f64, uncertain: &[String]) -> String {
    let label = if level >= 0.7 {
        "High confidence"
    } else if level >= 0.4 {
        "Medium confidence"
    } else {
        "Low confidence"
    };
    let mut explanation = format!("{label} ({:.0}%)", level * 100.0);
    if !uncertain.is_empty() {
        let top: Vec<&str> = uncertain.iter().take(2).map(String::as_str).collect();
        explanation.push_str(&format!(". Uncertainties: {}", top.join(", ")));
    }
    explanation
}
