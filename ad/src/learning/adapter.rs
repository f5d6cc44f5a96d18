//! Strategy adapter - turns tracked outcomes and lessons into action biases
//!
//! The adapter is the seam between the learning system and planning: it maps
//! success rates and lesson-derived modifiers into bounded per-action biases
//! and ranked preferences.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::lessons::Lesson;
use super::tracker::{ActionStats, ActionTracker};

/// Success rate that maps to zero bias
const NEUTRAL_RATE: f64 = 0.5;
/// Maximum absolute bias
const MAX_BIAS: f64 = 0.5;

/// Weight of the global tracker component
const TRACKER_WEIGHT: f64 = 0.4;
/// Weight of the lesson-derived context modifier
const LESSON_WEIGHT: f64 = 0.4;
/// Weight of the recent-window component
const RECENT_WEIGHT: f64 = 0.2;

/// Bias modifier for one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBias {
    pub action: String,
    /// Negative = avoid, positive = prefer; within [-0.5, 0.5] unless set by
    /// a manual override
    pub bias: f64,
    pub confidence: f64,
    pub reason: String,
    /// Comma-joined component sources, or "override"
    pub source: String,
}

/// Context fields the adapter keys biases on
#[derive(Debug, Clone, Default)]
pub struct AdaptationContext {
    pub goal: Option<String>,
    pub task_type: Option<String>,
    pub environment: Option<String>,
    pub previous_action: Option<String>,
    pub error_state: Option<String>,
}

impl AdaptationContext {
    /// Build from a raw context map, accepting the aliases the planner uses
    pub fn from_map(context: &BTreeMap<String, Value>) -> Self {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| context.get(*k))
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .next()
        };
        Self {
            goal: get(&["goal"]),
            task_type: get(&["task_type", "type"]),
            environment: get(&["environment", "env"]),
            previous_action: get(&["previous_action"]),
            error_state: get(&["error", "error_state"]),
        }
    }

    /// Stable fingerprint of this context; `"global"` when empty
    pub fn to_context_key(&self) -> String {
        let mut parts = Vec::new();
        if let Some(goal) = &self.goal {
            let truncated: String = goal.chars().take(50).collect();
            parts.push(format!("goal:{truncated}"));
        }
        if let Some(task_type) = &self.task_type {
            parts.push(format!("type:{task_type}"));
        }
        if let Some(environment) = &self.environment {
            parts.push(format!("env:{environment}"));
        }
        if let Some(error_state) = &self.error_state {
            parts.push(format!("err:{error_state}"));
        }

        if parts.is_empty() {
            return "global".to_string();
        }

        parts.sort();
        let digest = Sha256::digest(parts.join("|").as_bytes());
        hex_prefix(&digest, 12)
    }
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut out = String::with_capacity(len);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Serializable adapter state (overrides and learned modifiers)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterState {
    pub overrides: BTreeMap<String, ActionBias>,
    /// `"context_key:action"` -> modifier
    pub context_modifiers: BTreeMap<String, f64>,
}

/// Translates learned experience into planning biases
pub struct StrategyAdapter {
    tracker: Arc<ActionTracker>,
    overrides: Mutex<HashMap<String, ActionBias>>,
    context_modifiers: Mutex<HashMap<(String, String), f64>>,
    /// Actions the adapter may name when scanning `better_approach` text
    known_actions: Mutex<Vec<String>>,
}

impl StrategyAdapter {
    pub fn new(tracker: Arc<ActionTracker>) -> Self {
        Self {
            tracker,
            overrides: Mutex::new(HashMap::new()),
            context_modifiers: Mutex::new(HashMap::new()),
            known_actions: Mutex::new(Vec::new()),
        }
    }

    /// Declare the action vocabulary used for lesson text scanning
    pub fn set_known_actions(&self, actions: &[String]) {
        *self.known_actions.lock().expect("known actions poisoned") = actions.to_vec();
    }

    /// Biases for every candidate action in this context
    ///
    /// Without `available_actions`, every action the tracker has seen is
    /// evaluated.
    pub fn get_action_biases(
        &self,
        context: &AdaptationContext,
        available_actions: Option<&[String]>,
    ) -> BTreeMap<String, ActionBias> {
        let context_key = context.to_context_key();

        let candidates: Vec<String> = match available_actions {
            Some(actions) => actions.to_vec(),
            None => {
                let mut actions: Vec<String> =
                    self.tracker.get_all_stats().keys().cloned().collect();
                for known in self.known_actions.lock().expect("known actions poisoned").iter() {
                    if !actions.contains(known) {
                        actions.push(known.clone());
                    }
                }
                actions
            }
        };

        candidates
            .into_iter()
            .filter_map(|action| {
                self.calculate_bias(&action, &context_key)
                    .map(|bias| (action, bias))
            })
            .collect()
    }

    fn calculate_bias(&self, action: &str, context_key: &str) -> Option<ActionBias> {
        // Manual overrides short-circuit the calculation
        if let Some(bias) = self.overrides.lock().expect("overrides poisoned").get(action) {
            return Some(bias.clone());
        }

        // (bias, weight, source)
        let mut components: Vec<(f64, f64, &'static str)> = Vec::new();
        let stats = self.tracker.get_action_stats(action);

        if let Some(stats) = &stats {
            if stats.total_count > 0 {
                components.push((rate_to_bias(stats.success_rate()), TRACKER_WEIGHT, "tracker"));
            }
        }

        let context_rate = self.tracker.get_context_success_rate(context_key, action);
        if context_rate != NEUTRAL_RATE {
            components.push((rate_to_bias(context_rate), TRACKER_WEIGHT, "context"));
        }

        if let Some(stats) = &stats {
            if !stats.recent_rewards.is_empty() {
                components.push((
                    rate_to_bias(stats.recent_success_rate()),
                    RECENT_WEIGHT,
                    "recent",
                ));
            }
        }

        let modifier = self.get_context_modifier(context_key, action);
        if modifier != 0.0 {
            components.push((modifier, LESSON_WEIGHT, "modifier"));
        }

        if components.is_empty() {
            return None;
        }

        let total_weight: f64 = components.iter().map(|(_, w, _)| w).sum();
        let weighted: f64 =
            components.iter().map(|(b, w, _)| b * w).sum::<f64>() / total_weight;
        let bias = weighted.clamp(-MAX_BIAS, MAX_BIAS);

        let sources: Vec<&str> = components.iter().map(|(_, _, s)| *s).collect();
        Some(ActionBias {
            action: action.to_string(),
            bias,
            confidence: total_weight.min(1.0),
            reason: bias_reason(action, stats.as_ref(), bias),
            source: sources.join(","),
        })
    }

    /// Apply a lesson: penalize the failed action in its context and boost
    /// any action its better approach names
    pub fn update_from_lesson(&self, lesson: &Lesson) {
        let context_key = lesson
            .context_key
            .clone()
            .unwrap_or_else(|| "global".to_string());

        let penalty = -0.1 * (1.0 + lesson.reinforcement_count as f64 * 0.1);
        {
            let mut modifiers = self.context_modifiers.lock().expect("modifiers poisoned");
            *modifiers
                .entry((context_key.clone(), lesson.action.clone()))
                .or_insert(0.0) += penalty;
        }

        if !lesson.better_approach.is_empty() {
            let approach = lesson.better_approach.to_lowercase();
            let known = self.known_actions.lock().expect("known actions poisoned").clone();
            let mut modifiers = self.context_modifiers.lock().expect("modifiers poisoned");
            for action in known {
                if approach.contains(&action.to_lowercase()) {
                    *modifiers.entry((context_key.clone(), action)).or_insert(0.0) += 0.1;
                }
            }
        }

        debug!(summary = %lesson.summary, "Applied lesson to strategy");
    }

    /// Pin an action's bias, overriding all learned components
    pub fn set_override(&self, action: &str, bias: f64, reason: &str) {
        self.overrides.lock().expect("overrides poisoned").insert(
            action.to_string(),
            ActionBias {
                action: action.to_string(),
                bias: bias.clamp(-1.0, 1.0),
                confidence: 1.0,
                reason: reason.to_string(),
                source: "override".to_string(),
            },
        );
        debug!(action, bias, "Set override");
    }

    /// Remove a manual override; returns whether one existed
    pub fn remove_override(&self, action: &str) -> bool {
        self.overrides
            .lock()
            .expect("overrides poisoned")
            .remove(action)
            .is_some()
    }

    /// Actions ranked by bias, best first
    pub fn get_ranked_actions(
        &self,
        context: &AdaptationContext,
        available_actions: Option<&[String]>,
    ) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .get_action_biases(context, available_actions)
            .into_iter()
            .map(|(action, bias)| (action, bias.bias))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// The most preferred action for this context, if any has data
    pub fn get_preferred_action(
        &self,
        context: &AdaptationContext,
        available_actions: &[String],
    ) -> Option<String> {
        self.get_ranked_actions(context, Some(available_actions))
            .into_iter()
            .next()
            .map(|(action, _)| action)
    }

    /// Actions whose bias falls below `threshold`
    pub fn get_actions_to_avoid(
        &self,
        context: &AdaptationContext,
        threshold: f64,
    ) -> Vec<String> {
        self.get_action_biases(context, None)
            .into_iter()
            .filter(|(_, bias)| bias.bias < threshold)
            .map(|(action, _)| action)
            .collect()
    }

    /// Context key for a raw context map
    pub fn extract_context_features(&self, context: &BTreeMap<String, Value>) -> String {
        AdaptationContext::from_map(context).to_context_key()
    }

    /// Learned modifier for a (context, action) pair
    pub fn get_context_modifier(&self, context_key: &str, action: &str) -> f64 {
        self.context_modifiers
            .lock()
            .expect("modifiers poisoned")
            .get(&(context_key.to_string(), action.to_string()))
            .copied()
            .unwrap_or(0.0)
    }

    /// Drop all learned context modifiers
    pub fn reset_modifiers(&self) {
        self.context_modifiers.lock().expect("modifiers poisoned").clear();
        debug!("Context modifiers reset");
    }

    /// Export overrides and modifiers
    pub fn export_state(&self) -> AdapterState {
        AdapterState {
            overrides: self
                .overrides
                .lock()
                .expect("overrides poisoned")
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            context_modifiers: self
                .context_modifiers
                .lock()
                .expect("modifiers poisoned")
                .iter()
                .map(|((ctx, action), value)| (format!("{ctx}:{action}"), *value))
                .collect(),
        }
    }

    /// Restore overrides and modifiers, replacing current state
    pub fn import_state(&self, state: AdapterState) {
        *self.overrides.lock().expect("overrides poisoned") =
            state.overrides.into_iter().collect();

        let mut modifiers = self.context_modifiers.lock().expect("modifiers poisoned");
        modifiers.clear();
        for (key, value) in state.context_modifiers {
            if let Some((ctx, action)) = key.split_once(':') {
                modifiers.insert((ctx.to_string(), action.to_string()), value);
            }
        }
        debug!("StrategyAdapter state restored");
    }
}

fn rate_to_bias(rate: f64) -> f64 {
    (rate - NEUTRAL_RATE) * 2.0 * MAX_BIAS
}

fn bias_reason(action: &str, stats: Option<&ActionStats>, bias: f64) -> String {
    let Some(stats) = stats else {
        return format!("No historical data for {action}");
    };
    let rate = stats.success_rate() * 100.0;
    let count = stats.total_count;
    if bias > 0.1 {
        format!("{action} has {rate:.0}% success rate ({count} uses)")
    } else if bias < -0.1 {
        format!("{action} has low success ({rate:.0}% over {count} uses)")
    } else {
        format!("{action} has neutral performance ({rate:.0}%)")
    }
}
