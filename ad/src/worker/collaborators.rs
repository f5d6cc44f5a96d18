//! Collaborator seams for the worker loop
//!
//! Planning and execution are external concerns; the worker drives them
//! through these traits. Scripted implementations ship for tests and for
//! running the loop without a model attached.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::learning::ActionBias;

/// The planner's choice for the next cycle
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action: String,
    /// Not every planner produces reasoning
    pub reasoning: Option<String>,
}

/// Chooses the next action from state, history, and learned biases
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        agent_state: &str,
        recent_actions: &[String],
        biases: &BTreeMap<String, ActionBias>,
    ) -> eyre::Result<PlannedAction>;
}

/// The result of executing one action
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub outcome: Option<String>,
    /// Reward override in [-1, 1]; the worker derives one from `success`
    /// when absent
    pub reward: Option<f64>,
    /// Agent state after the action, when it transitions
    pub next_state: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(outcome: &str) -> Self {
        Self {
            success: true,
            outcome: Some(outcome.to_string()),
            reward: None,
            next_state: None,
        }
    }

    pub fn failure(outcome: &str) -> Self {
        Self {
            success: false,
            outcome: Some(outcome.to_string()),
            reward: None,
            next_state: None,
        }
    }
}

/// Executes actions against the outside world
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Names of the actions this executor understands
    fn available_actions(&self) -> Vec<String>;

    async fn execute(
        &self,
        action: &str,
        params: &BTreeMap<String, Value>,
    ) -> eyre::Result<ExecutionOutcome>;
}

/// Planner that replays a fixed script of actions, wrapping at the end
pub struct ScriptedPlanner {
    script: Vec<String>,
    position: Mutex<usize>,
}

impl ScriptedPlanner {
    pub fn new(script: Vec<String>) -> Self {
        Self {
            script,
            position: Mutex::new(0),
        }
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _agent_state: &str,
        _recent_actions: &[String],
        biases: &BTreeMap<String, ActionBias>,
    ) -> eyre::Result<PlannedAction> {
        if self.script.is_empty() {
            eyre::bail!("Planner has no actions to choose from");
        }
        let mut position = self.position.lock().expect("planner position poisoned");
        let action = self.script[*position % self.script.len()].clone();
        *position += 1;

        let reasoning = biases
            .get(&action)
            .map(|bias| format!("scripted choice (bias {:+.2})", bias.bias));
        Ok(PlannedAction { action, reasoning })
    }
}

/// Executor that succeeds for every known action except a configured failure
/// set
pub struct ScriptedExecutor {
    actions: Vec<String>,
    failing: HashSet<String>,
}

impl ScriptedExecutor {
    pub fn new(actions: Vec<String>) -> Self {
        Self {
            actions,
            failing: HashSet::new(),
        }
    }

    /// Make an action fail with a canned error outcome
    pub fn failing_action(mut self, action: &str) -> Self {
        self.failing.insert(action.to_string());
        self
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    fn available_actions(&self) -> Vec<String> {
        self.actions.clone()
    }

    async fn execute(
        &self,
        action: &str,
        _params: &BTreeMap<String, Value>,
    ) -> eyre::Result<ExecutionOutcome> {
        if !self.actions.iter().any(|a| a == action) {
            eyre::bail!("Unknown action: {action}");
        }
        if self.failing.contains(action) {
            Ok(ExecutionOutcome::failure(&format!("{action} failed: timeout")))
        } else {
            Ok(ExecutionOutcome::success(&format!("{action} done")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_planner_wraps() {
        let planner = ScriptedPlanner::new(vec!["a".to_string(), "b".to_string()]);
        let biases = BTreeMap::new();

        let first = planner.plan("idle", &[], &biases).await.unwrap();
        let second = planner.plan("idle", &[], &biases).await.unwrap();
        let third = planner.plan("idle", &[], &biases).await.unwrap();

        assert_eq!(first.action, "a");
        assert_eq!(second.action, "b");
        assert_eq!(third.action, "a");
    }

    #[tokio::test]
    async fn test_empty_planner_errors() {
        let planner = ScriptedPlanner::new(vec![]);
        assert!(planner.plan("idle", &[], &BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_executor() {
        let executor =
            ScriptedExecutor::new(vec!["observe".to_string(), "post".to_string()])
                .failing_action("post");

        let ok = executor.execute("observe", &BTreeMap::new()).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.outcome.as_deref(), Some("observe done"));

        let failed = executor.execute("post", &BTreeMap::new()).await.unwrap();
        assert!(!failed.success);

        assert!(executor.execute("unknown", &BTreeMap::new()).await.is_err());
    }
}
