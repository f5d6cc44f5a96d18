//! Adaptive learning - learn from every action
//!
//! Coordinates the action tracker, self-critic, lesson repository, and
//! strategy adapter so each outcome updates the agent's future preferences.

mod adapter;
mod critic;
mod lessons;
mod tracker;

pub use adapter::{ActionBias, AdaptationContext, AdapterState, StrategyAdapter};
pub use critic::{
    Critique, CritiqueLevel, CritiqueModel, FailedAction, ImprovementSuggestion, SelfCritic,
};
pub use lessons::{
    Embedder, HashEmbedder, Lesson, LessonRepository, LessonStatistics, MemoryVectorStore,
    VectorStore,
};
pub use tracker::{ActionOutcome, ActionStats, ActionTracker};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

/// Configuration for the learning module
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Run the critic when an action fails
    pub critique_on_failure: bool,
    /// Critique only when the reward falls below this
    pub critique_threshold: f64,
    /// Turn confident critiques into stored lessons
    pub auto_create_lessons: bool,
    /// Minimum critique confidence for lesson creation
    pub min_confidence_for_lesson: f64,
    /// Failures retained for pattern analysis
    pub max_recent_failures: usize,
    /// Failures required before pattern analysis runs
    pub analyze_patterns_threshold: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            critique_on_failure: true,
            critique_threshold: 0.3,
            auto_create_lessons: true,
            min_confidence_for_lesson: 0.5,
            max_recent_failures: 50,
            analyze_patterns_threshold: 5,
        }
    }
}

/// What one outcome taught the agent
#[derive(Debug, Clone)]
pub struct LearningOutcome {
    pub action: String,
    pub reward: f64,
    pub success: bool,
    pub critique: Option<Critique>,
    pub lesson_created: Option<Lesson>,
    /// Lesson id when an existing lesson was reinforced instead
    pub lesson_reinforced: Option<String>,
    pub new_success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Unified interface over tracking, critique, lessons, and strategy biasing
pub struct AdaptiveLearningModule {
    config: LearningConfig,
    tracker: Arc<ActionTracker>,
    critic: SelfCritic,
    lessons: Arc<LessonRepository>,
    adapter: StrategyAdapter,
    recent_failures: Mutex<Vec<FailedAction>>,
}

impl Default for AdaptiveLearningModule {
    fn default() -> Self {
        Self::new(LearningConfig::default())
    }
}

impl AdaptiveLearningModule {
    pub fn new(config: LearningConfig) -> Self {
        let tracker = Arc::new(ActionTracker::new());
        let module = Self {
            config,
            adapter: StrategyAdapter::new(tracker.clone()),
            tracker,
            critic: SelfCritic::new(),
            lessons: Arc::new(LessonRepository::default()),
            recent_failures: Mutex::new(Vec::new()),
        };
        info!("AdaptiveLearningModule initialized");
        module
    }

    /// Declare the action vocabulary (used for lesson text scanning)
    pub fn set_known_actions(&self, actions: &[String]) {
        self.adapter.set_known_actions(actions);
    }

    /// Learn from one action outcome; the main entry point
    ///
    /// Success is derived from the reward sign: `reward > 0` counts as
    /// success.
    pub async fn learn_from_outcome(
        &self,
        action: &str,
        context: &BTreeMap<String, Value>,
        outcome: Option<&str>,
        reward: f64,
        error_message: Option<&str>,
    ) -> LearningOutcome {
        let success = reward > 0.0;
        let context_key = self.adapter.extract_context_features(context);

        self.tracker
            .record(action, &context_key, reward, success, None);

        let mut learning = LearningOutcome {
            action: action.to_string(),
            reward,
            success,
            critique: None,
            lesson_created: None,
            lesson_reinforced: None,
            new_success_rate: self.tracker.get_success_rate(action),
            timestamp: Utc::now(),
        };

        if !success
            && self.config.critique_on_failure
            && reward < self.config.critique_threshold
        {
            let critique = self
                .critic
                .critique(action, context, outcome, error_message)
                .await;

            {
                let mut failures = self.recent_failures.lock().expect("failures poisoned");
                failures.push(FailedAction {
                    action: action.to_string(),
                    context: context.clone(),
                    outcome: outcome.map(str::to_string),
                    error_message: error_message.map(str::to_string),
                    timestamp: Utc::now(),
                });
                if failures.len() > self.config.max_recent_failures {
                    failures.remove(0);
                }
            }

            if self.config.auto_create_lessons
                && critique.confidence >= self.config.min_confidence_for_lesson
            {
                let lesson = Lesson::create(
                    &critique.lesson_learned,
                    &critique.context_summary,
                    &critique.action,
                    &critique.what_went_wrong,
                    &critique.better_approach,
                    Some(context_key.clone()),
                    critique.confidence,
                );
                match self.lessons.store(lesson.clone()).await {
                    Ok(id) if id == lesson.id => {
                        self.adapter.update_from_lesson(&lesson);
                        learning.lesson_created = Some(lesson);
                    }
                    Ok(id) => {
                        // Merged into an existing lesson
                        if let Some(existing) = self.lessons.get_lesson(&id) {
                            self.adapter.update_from_lesson(&existing);
                        }
                        learning.lesson_reinforced = Some(id);
                    }
                    Err(e) => debug!(error = %e, "Failed to store lesson"),
                }
            }

            learning.critique = Some(critique);
        }

        debug!(
            action,
            reward,
            success_rate = learning.new_success_rate,
            "Learned from outcome"
        );
        learning
    }

    /// Biases the planner should apply in this context
    pub fn get_action_biases(
        &self,
        context: &BTreeMap<String, Value>,
        available_actions: Option<&[String]>,
    ) -> BTreeMap<String, ActionBias> {
        let adaptation = AdaptationContext::from_map(context);
        self.adapter.get_action_biases(&adaptation, available_actions)
    }

    /// Lessons relevant to the current situation
    pub async fn get_relevant_lessons(
        &self,
        context: &BTreeMap<String, Value>,
        top_k: usize,
    ) -> Vec<Lesson> {
        self.lessons
            .find_relevant(context, top_k, 0.3)
            .await
            .unwrap_or_default()
    }

    /// Pattern analysis over recent failures; empty below the threshold
    pub fn analyze_recent_failures(&self) -> Vec<ImprovementSuggestion> {
        let failures = self.recent_failures.lock().expect("failures poisoned").clone();
        if failures.len() < self.config.analyze_patterns_threshold {
            return Vec::new();
        }
        self.critic.generate_improvement_suggestions(&failures)
    }

    /// Success rate for an action
    pub fn get_success_rate(&self, action: &str) -> f64 {
        self.tracker.get_success_rate(action)
    }

    /// Stats for an action, if tracked
    pub fn get_action_stats(&self, action: &str) -> Option<ActionStats> {
        self.tracker.get_action_stats(action)
    }

    /// Actions failing below the threshold
    pub fn get_failing_actions(&self, threshold: f64) -> Vec<(String, ActionStats)> {
        self.tracker.get_failing_actions(threshold, 5)
    }

    /// Best action for a context, restricted to `available_actions`
    pub fn get_best_action_for_context(
        &self,
        context: &BTreeMap<String, Value>,
        available_actions: &[String],
    ) -> Option<String> {
        let adaptation = AdaptationContext::from_map(context);
        self.adapter.get_preferred_action(&adaptation, available_actions)
    }

    /// Actions to avoid in this context
    pub fn get_actions_to_avoid(&self, context: &BTreeMap<String, Value>) -> Vec<String> {
        let adaptation = AdaptationContext::from_map(context);
        self.adapter.get_actions_to_avoid(&adaptation, -0.2)
    }

    /// Recent critiques, oldest first
    pub fn get_recent_critiques(&self, limit: usize) -> Vec<Critique> {
        self.critic.get_recent_critiques(limit)
    }

    /// The shared tracker
    pub fn tracker(&self) -> &Arc<ActionTracker> {
        &self.tracker
    }

    /// The lesson repository
    pub fn lessons(&self) -> &Arc<LessonRepository> {
        &self.lessons
    }

    /// The strategy adapter
    pub fn adapter(&self) -> &StrategyAdapter {
        &self.adapter
    }

    /// Reset all learning state
    pub fn reset(&self) {
        self.tracker.clear();
        self.critic.clear();
        self.adapter.reset_modifiers();
        self.lessons.clear_cache();
        self.recent_failures.lock().expect("failures poisoned").clear();
        info!("AdaptiveLearningModule reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(key: &str, value: &str) -> BTreeMap<String, Value> {
        let mut context = BTreeMap::new();
        context.insert(key.to_string(), serde_json::json!(value));
        context
    }

    #[tokio::test]
    async fn test_success_updates_tracker_without_critique() {
        let module = AdaptiveLearningModule::default();
        let learning = module
            .learn_from_outcome("post", &BTreeMap::new(), Some("posted"), 0.8, None)
            .await;

        assert!(learning.success);
        assert!(learning.critique.is_none());
        assert!(learning.lesson_created.is_none());
        assert_eq!(learning.new_success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_failure_produces_critique_and_lesson() {
        let module = AdaptiveLearningModule::default();
        let learning = module
            .learn_from_outcome(
                "post",
                &context_with("goal", "share update"),
                None,
                -0.8,
                Some("429 too many requests"),
            )
            .await;

        assert!(!learning.success);
        let critique = learning.critique.as_ref().unwrap();
        assert_eq!(critique.source, "rule_based");
        // Rule-based confidence 0.6 clears the lesson threshold
        let lesson = learning.lesson_created.as_ref().unwrap();
        assert_eq!(lesson.action, "post");
        assert_eq!(module.lessons().get_all_lessons().len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_critique_creates_no_lesson() {
        let module = AdaptiveLearningModule::default();
        let learning = module
            .learn_from_outcome("mystery", &BTreeMap::new(), Some("odd outcome"), -0.8, None)
            .await;

        // Fallback critique confidence 0.4 is below the 0.5 threshold
        assert!(learning.critique.is_some());
        assert!(learning.lesson_created.is_none());
        assert!(module.lessons().get_all_lessons().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failure_reinforces_lesson() {
        let module = AdaptiveLearningModule::default();
        let context = context_with("goal", "share update");

        let first = module
            .learn_from_outcome("post", &context, None, -0.8, Some("429 rate limit"))
            .await;
        let second = module
            .learn_from_outcome("post", &context, None, -0.8, Some("429 rate limit"))
            .await;

        let created = first.lesson_created.unwrap();
        assert_eq!(second.lesson_reinforced.as_deref(), Some(created.id.as_str()));
        assert_eq!(module.lessons().get_all_lessons().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_biases_against_action() {
        let module = AdaptiveLearningModule::default();
        let context = context_with("goal", "share update");

        for _ in 0..5 {
            module
                .learn_from_outcome("post", &context, None, -1.0, Some("429"))
                .await;
        }

        let biases = module.get_action_biases(&context, Some(&["post".to_string()]));
        assert!(biases["post"].bias < 0.0);
        assert_eq!(module.get_actions_to_avoid(&context), vec!["post".to_string()]);
    }

    #[tokio::test]
    async fn test_pattern_analysis_needs_threshold() {
        let module = AdaptiveLearningModule::default();
        for _ in 0..4 {
            module
                .learn_from_outcome("post", &BTreeMap::new(), None, -1.0, Some("429"))
                .await;
        }
        assert!(module.analyze_recent_failures().is_empty());

        module
            .learn_from_outcome("post", &BTreeMap::new(), None, -1.0, Some("429"))
            .await;
        let suggestions = module.analyze_recent_failures();
        assert!(!suggestions.is_empty());
        assert_eq!(suggestions[0].priority, 1);
    }

    #[tokio::test]
    async fn test_relevant_lessons_retrieved() {
        let module = AdaptiveLearningModule::default();
        module
            .learn_from_outcome(
                "post",
                &context_with("goal", "share update"),
                None,
                -0.8,
                Some("429 too many requests"),
            )
            .await;

        let mut query = BTreeMap::new();
        query.insert("action".to_string(), serde_json::json!("post"));
        let lessons = module.get_relevant_lessons(&query, 3).await;
        assert_eq!(lessons.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let module = AdaptiveLearningModule::default();
        module
            .learn_from_outcome("post", &BTreeMap::new(), None, -1.0, Some("429"))
            .await;
        module.reset();

        assert_eq!(module.get_success_rate("post"), 0.5);
        assert!(module.lessons().get_all_lessons().is_empty());
        assert!(module.get_recent_critiques(10).is_empty());
    }
}
