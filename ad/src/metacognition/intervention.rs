//! Intervention types issued by the metacognitive monitor

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of interventions the monitor can trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    /// No intervention needed
    Continue,
    /// Force a different approach
    BreakLoop,
    /// Replan before a predicted failure
    #[serde(rename = "replan")]
    PreemptiveReplan,
    /// Ask for human help
    HumanHandoff,
    /// Wait before continuing
    Pause,
    /// Stop the current goal entirely
    Abort,
    /// Slow down the action rate
    Throttle,
    /// Use a fallback action
    Fallback,
}

/// A directive from the monitor about the next action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    #[serde(rename = "type")]
    pub intervention_type: InterventionType,
    pub reason: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
    #[serde(default)]
    pub wait_seconds: f64,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    /// 1 = low, 5 = critical
    pub priority: u8,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

impl Intervention {
    fn new(intervention_type: InterventionType, reason: &str, priority: u8) -> Self {
        Self {
            intervention_type,
            reason: reason.to_string(),
            suggested_action: None,
            wait_seconds: 0.0,
            context: BTreeMap::new(),
            created_at: Utc::now(),
            priority,
            alternatives: Vec::new(),
        }
    }

    /// Whether this intervention requires the caller to act
    pub fn requires_action(&self) -> bool {
        self.intervention_type != InterventionType::Continue
    }

    /// Whether this intervention blocks normal execution
    pub fn blocks_execution(&self) -> bool {
        matches!(
            self.intervention_type,
            InterventionType::Abort | InterventionType::HumanHandoff | InterventionType::Pause
        )
    }

    /// Whether this is a critical intervention
    pub fn is_critical(&self) -> bool {
        self.priority >= 4 || self.intervention_type == InterventionType::Abort
    }

    /// No intervention needed
    pub fn continue_execution() -> Self {
        Self::new(InterventionType::Continue, "No intervention needed", 1)
    }

    /// Break a detected loop, optionally suggesting a different action
    pub fn break_loop(
        reason: &str,
        suggested_action: Option<String>,
        alternatives: Vec<String>,
    ) -> Self {
        let mut intervention = Self::new(InterventionType::BreakLoop, reason, 3);
        intervention.suggested_action = suggested_action;
        intervention.alternatives = alternatives;
        intervention
    }

    /// Replan before a predicted failure
    pub fn preemptive_replan(reason: &str, context: BTreeMap<String, Value>) -> Self {
        let mut intervention = Self::new(InterventionType::PreemptiveReplan, reason, 2);
        intervention.context = context;
        intervention
    }

    /// Hand off to a human
    pub fn human_handoff(reason: &str, context: BTreeMap<String, Value>) -> Self {
        let mut intervention = Self::new(InterventionType::HumanHandoff, reason, 4);
        intervention.context = context;
        intervention
    }

    /// Wait before continuing
    pub fn pause(reason: &str, wait_seconds: f64) -> Self {
        let mut intervention = Self::new(InterventionType::Pause, reason, 2);
        intervention.wait_seconds = wait_seconds;
        intervention
    }

    /// Stop the current goal entirely
    pub fn abort(reason: &str, context: BTreeMap<String, Value>) -> Self {
        let mut intervention = Self::new(InterventionType::Abort, reason, 5);
        intervention.context = context;
        intervention
    }

    /// Slow down the action rate
    pub fn throttle(reason: &str, wait_seconds: f64) -> Self {
        let mut intervention = Self::new(InterventionType::Throttle, reason, 2);
        intervention.wait_seconds = wait_seconds;
        intervention
    }

    /// Use a fallback action
    pub fn fallback(reason: &str, suggested_action: &str, alternatives: Vec<String>) -> Self {
        let mut intervention = Self::new(InterventionType::Fallback, reason, 2);
        intervention.suggested_action = Some(suggested_action.to_string());
        intervention.alternatives = alternatives;
        intervention
    }
}

impl std::fmt::Display for Intervention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason: String = self.reason.chars().take(50).collect();
        write!(f, "Intervention({:?}: {reason})", self.intervention_type)
    }
}
