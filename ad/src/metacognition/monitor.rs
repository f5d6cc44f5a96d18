//! Metacognitive monitor - unified self-awareness interface
//!
//! An external supervisor watching the primary agent, decoupled from task
//! execution. Before each action it runs loop detection, failure prediction,
//! and confidence estimation, and selects at most one intervention.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::confidence::{ConfidenceEstimator, ConfidenceInputs};
use super::failure_predictor::FailurePredictor;
use super::handoff::{HandoffChannel, HumanHandoff, HumanResponse, RequestUrgency};
use super::intervention::{Intervention, InterventionType};
use super::loop_detector::LoopDetector;
use crate::learning::{ActionOutcome, ActionTracker};

/// Consecutive failures before the monitor aborts
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Interventions retained in history
const MAX_INTERVENTION_HISTORY: usize = 200;

/// Current monitoring state
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringState {
    pub is_stuck: bool,
    pub confidence_level: f64,
    pub failure_risk: f64,
    pub last_intervention: Option<Intervention>,
    pub intervention_count: u64,
    pub actions_since_intervention: u64,
    pub created_at: DateTime<Utc>,
}

impl Default for MonitoringState {
    fn default() -> Self {
        Self {
            is_stuck: false,
            confidence_level: 0.5,
            failure_risk: 0.0,
            last_intervention: None,
            intervention_count: 0,
            actions_since_intervention: 0,
            created_at: Utc::now(),
        }
    }
}

/// Inputs for one pre-action monitoring pass
#[derive(Debug, Clone, Default)]
pub struct MonitorInputs<'a> {
    pub goal: Option<&'a str>,
    pub plan: Option<&'a BTreeMap<String, Value>>,
    pub available_actions: Option<&'a [String]>,
}

/// Monitor statistics
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub state: MonitoringState,
    pub total_interventions: usize,
    pub consecutive_failures: u32,
    pub handoff_enabled: bool,
}

/// Watches the agent and issues interventions before risky actions
pub struct MetacognitiveMonitor {
    loop_detector: LoopDetector,
    failure_predictor: FailurePredictor,
    confidence_estimator: ConfidenceEstimator,
    human_handoff: HumanHandoff,
    tracker: Option<Arc<ActionTracker>>,
    enable_handoff: bool,
    state: Mutex<MonitoringState>,
    intervention_history: Mutex<Vec<Intervention>>,
    consecutive_failures: Mutex<u32>,
}

impl MetacognitiveMonitor {
    pub fn new(
        tracker: Option<Arc<ActionTracker>>,
        enable_handoff: bool,
        handoff_channel: HandoffChannel,
    ) -> Self {
        let monitor = Self {
            loop_detector: LoopDetector::default(),
            failure_predictor: FailurePredictor::new(tracker.clone()),
            confidence_estimator: ConfidenceEstimator::new(),
            human_handoff: HumanHandoff::new(handoff_channel, 3600.0),
            tracker,
            enable_handoff,
            state: Mutex::new(MonitoringState::default()),
            intervention_history: Mutex::new(Vec::new()),
            consecutive_failures: Mutex::new(0),
        };
        info!("MetacognitiveMonitor initialized");
        monitor
    }

    /// Main monitoring pass, called before each action execution
    ///
    /// Returns at most one intervention; `Continue` means proceed.
    pub fn monitor(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
        inputs: &MonitorInputs<'_>,
    ) -> Intervention {
        self.state
            .lock()
            .expect("monitor state poisoned")
            .actions_since_intervention += 1;

        // 1. Loop check
        let loop_intervention = self.check_loops(action, context, inputs.available_actions);
        if loop_intervention.intervention_type != InterventionType::Continue {
            return self.record_intervention(loop_intervention);
        }

        // 2. Failure prediction
        let failure_intervention = self.check_failure_prediction(action, context);
        if failure_intervention.intervention_type != InterventionType::Continue {
            return self.record_intervention(failure_intervention);
        }

        // 3. Confidence check
        let confidence_intervention = self.check_confidence(action, context, inputs);
        if confidence_intervention.intervention_type != InterventionType::Continue {
            return self.record_intervention(confidence_intervention);
        }

        // 4. Consecutive failures
        let failures = *self.consecutive_failures.lock().expect("failures poisoned");
        if failures >= MAX_CONSECUTIVE_FAILURES {
            let mut context_map = BTreeMap::new();
            context_map.insert(
                "consecutive_failures".to_string(),
                serde_json::json!(failures),
            );
            let abort = Intervention::abort(
                &format!("Too many consecutive failures ({failures})"),
                context_map,
            );
            return self.record_intervention(abort);
        }

        Intervention::continue_execution()
    }

    fn check_loops(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
        available_actions: Option<&[String]>,
    ) -> Intervention {
        let context_hash = hash_context(context);

        if self.loop_detector.is_stuck(action, &context_hash) {
            self.state.lock().expect("monitor state poisoned").is_stuck = true;

            let mut alternatives = Vec::new();
            if let Some(available) = available_actions {
                if let Some(suggestion) = self.loop_detector.suggest_break_action(available) {
                    alternatives.push(suggestion);
                }
            }

            return Intervention::break_loop(
                &self.loop_detector.get_loop_description(),
                alternatives.first().cloned(),
                alternatives,
            );
        }

        self.state.lock().expect("monitor state poisoned").is_stuck = false;
        Intervention::continue_execution()
    }

    fn check_failure_prediction(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
    ) -> Intervention {
        let prediction = self.failure_predictor.predict(action, context);
        self.state.lock().expect("monitor state poisoned").failure_risk = prediction.probability;

        if prediction.is_high_risk() {
            let reason = prediction.reason_details.join(", ");

            if let Some(first) = prediction.suggested_alternatives.first() {
                return Intervention::fallback(
                    &reason,
                    first,
                    prediction.suggested_alternatives.clone(),
                );
            }
            if prediction.wait_seconds > 0.0 {
                return Intervention::pause(&reason, prediction.wait_seconds);
            }
            let mut context_map = BTreeMap::new();
            context_map.insert(
                "probability".to_string(),
                serde_json::json!(prediction.probability),
            );
            return Intervention::preemptive_replan(&reason, context_map);
        }

        Intervention::continue_execution()
    }

    fn check_confidence(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
        inputs: &MonitorInputs<'_>,
    ) -> Intervention {
        let success_rate = self
            .tracker
            .as_ref()
            .map_or(0.5, |tracker| tracker.get_success_rate(action));
        let error_state = context
            .get("error_state")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let estimate = self.confidence_estimator.estimate(&ConfidenceInputs {
            goal: inputs.goal,
            plan: inputs.plan,
            context: Some(context),
            available_tools: None,
            memory_matches: None,
            success_rate,
            error_state,
        });

        self.state
            .lock()
            .expect("monitor state poisoned")
            .confidence_level = estimate.level;

        if estimate.should_request_help && self.enable_handoff {
            let mut context_map = BTreeMap::new();
            context_map.insert("action".to_string(), serde_json::json!(action));
            context_map.insert(
                "confidence".to_string(),
                serde_json::to_value(&estimate).unwrap_or(Value::Null),
            );
            if let Some(goal) = inputs.goal {
                context_map.insert("goal".to_string(), serde_json::json!(goal));
            }
            if let Some(benefit) = &estimate.would_benefit_from {
                context_map.insert("would_benefit_from".to_string(), serde_json::json!(benefit));
            }
            return Intervention::human_handoff(&estimate.explanation, context_map);
        }

        Intervention::continue_execution()
    }

    fn record_intervention(&self, intervention: Intervention) -> Intervention {
        {
            let mut state = self.state.lock().expect("monitor state poisoned");
            state.last_intervention = Some(intervention.clone());
            state.intervention_count += 1;
            state.actions_since_intervention = 0;
        }
        {
            let mut history = self
                .intervention_history
                .lock()
                .expect("history poisoned");
            history.push(intervention.clone());
            if history.len() > MAX_INTERVENTION_HISTORY {
                history.remove(0);
            }
        }
        warn!(%intervention, "Intervention triggered");
        intervention
    }

    /// Record the result of an executed action
    ///
    /// Success resets the consecutive-failure counter; failure increments it
    /// and feeds the predictor's recent-failure accounting.
    pub fn record_action_result(&self, action: &str, success: bool, error_message: Option<&str>) {
        let mut failures = self.consecutive_failures.lock().expect("failures poisoned");
        if success {
            *failures = 0;
            return;
        }
        *failures += 1;
        drop(failures);

        if self.tracker.is_some() {
            let mut metadata = BTreeMap::new();
            if let Some(error) = error_message {
                metadata.insert("error".to_string(), serde_json::json!(error));
            }
            self.failure_predictor.record_failure(ActionOutcome {
                id: "failure".to_string(),
                action: action.to_string(),
                context_key: "failure".to_string(),
                reward: -1.0,
                success: false,
                timestamp: Utc::now(),
                metadata,
            });
        }
    }

    /// Request human help through the handoff channel
    pub async fn request_human_help(
        &self,
        question: &str,
        context: BTreeMap<String, Value>,
        options: Vec<String>,
        timeout: f64,
    ) -> Option<HumanResponse> {
        if !self.enable_handoff {
            warn!("Human handoff is disabled");
            return None;
        }
        self.human_handoff
            .request_help(
                question,
                context,
                RequestUrgency::Medium,
                options,
                Some(timeout),
                None,
            )
            .await
    }

    /// Snapshot of the monitoring state
    pub fn get_state(&self) -> MonitoringState {
        self.state.lock().expect("monitor state poisoned").clone()
    }

    /// The loop detector
    pub fn loop_detector(&self) -> &LoopDetector {
        &self.loop_detector
    }

    /// The failure predictor
    pub fn failure_predictor(&self) -> &FailurePredictor {
        &self.failure_predictor
    }

    /// The confidence estimator
    pub fn confidence_estimator(&self) -> &ConfidenceEstimator {
        &self.confidence_estimator
    }

    /// The human handoff handler
    pub fn human_handoff(&self) -> &HumanHandoff {
        &self.human_handoff
    }

    /// Recent interventions, oldest first
    pub fn get_intervention_history(&self, limit: usize) -> Vec<Intervention> {
        let history = self.intervention_history.lock().expect("history poisoned");
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    /// Reset all monitoring state
    pub fn clear(&self) {
        self.loop_detector.clear();
        self.failure_predictor.clear();
        self.human_handoff.clear();
        self.intervention_history.lock().expect("history poisoned").clear();
        *self.consecutive_failures.lock().expect("failures poisoned") = 0;
        *self.state.lock().expect("monitor state poisoned") = MonitoringState::default();
    }

    /// Monitor statistics
    pub fn get_statistics(&self) -> MonitorStats {
        MonitorStats {
            state: self.get_state(),
            total_interventions: self
                .intervention_history
                .lock()
                .expect("history poisoned")
                .len(),
            consecutive_failures: *self.consecutive_failures.lock().expect("failures poisoned"),
            handoff_enabled: self.enable_handoff,
        }
    }
}

impl Default for MetacognitiveMonitor {
    fn default() -> Self {
        Self::new(None, true, HandoffChannel::Console)
    }
}

/// Short stable hash of a context map for loop detection
fn hash_context(context: &BTreeMap<String, Value>) -> String {
    let raw = serde_json::to_string(context).unwrap_or_default();
    let digest = Sha256::digest(raw.as_bytes());
    format!("{:02x}{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2], digest[3])
}
