//! Loop detector - spots repetitive behavior in recent actions
//!
//! Sliding-window analysis over the last N `(action, context_hash)` pairs.
//! Patterns, in detection precedence: repetition (A-A-A), alternation
//! (A-B-A-B), and longer cycles (A-B-C-A-B-C).

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Kinds of detected loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    None,
    /// Same action repeated
    Repetition,
    /// Two actions alternating
    Alternation,
    /// N actions in a repeating cycle
    Cycle,
}

/// A detected loop pattern
#[derive(Debug, Clone, Serialize)]
pub struct LoopPattern {
    pub loop_type: LoopType,
    /// Actions in the pattern
    pub pattern: Vec<String>,
    /// How many times the pattern repeated
    pub repetitions: usize,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
}

impl LoopPattern {
    fn none() -> Self {
        Self {
            loop_type: LoopType::None,
            pattern: Vec::new(),
            repetitions: 0,
            confidence: 0.0,
            first_seen: Utc::now(),
        }
    }

    /// Human-readable description of the loop
    pub fn description(&self) -> String {
        match self.loop_type {
            LoopType::Repetition => format!(
                "Action '{}' repeated {} times",
                self.pattern.first().map(String::as_str).unwrap_or(""),
                self.repetitions
            ),
            LoopType::Alternation => format!(
                "Alternating between '{}' and '{}'",
                self.pattern.first().map(String::as_str).unwrap_or(""),
                self.pattern.get(1).map(String::as_str).unwrap_or(""),
            ),
            LoopType::Cycle => format!(
                "Cyclic pattern: {} (repeated {}x)",
                self.pattern.join(" -> "),
                self.repetitions
            ),
            LoopType::None => "No loop detected".to_string(),
        }
    }
}

struct DetectorInner {
    recent: VecDeque<(String, String)>,
    last_detected: Option<LoopPattern>,
}

/// Detector statistics
#[derive(Debug, Clone, Serialize)]
pub struct LoopDetectorStats {
    pub window_size: usize,
    pub actions_tracked: usize,
    pub unique_actions: usize,
    pub is_stuck: bool,
}

/// Detects when the agent is stuck in repetitive behavior
pub struct LoopDetector {
    window_size: usize,
    repetition_threshold: usize,
    alternation_threshold: usize,
    cycle_threshold: usize,
    inner: Mutex<DetectorInner>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(20, 3, 4, 2)
    }
}

impl LoopDetector {
    pub fn new(
        window_size: usize,
        repetition_threshold: usize,
        alternation_threshold: usize,
        cycle_threshold: usize,
    ) -> Self {
        debug!(window_size, repetition_threshold, "LoopDetector initialized");
        Self {
            window_size,
            repetition_threshold,
            alternation_threshold,
            cycle_threshold,
            inner: Mutex::new(DetectorInner {
                recent: VecDeque::with_capacity(window_size),
                last_detected: None,
            }),
        }
    }

    /// Record an action without running detection
    pub fn record_action(&self, action: &str, context_hash: &str) {
        let mut inner = self.inner.lock().expect("detector poisoned");
        if inner.recent.len() == self.window_size {
            inner.recent.pop_front();
        }
        inner
            .recent
            .push_back((action.to_string(), context_hash.to_string()));
    }

    /// Record the action and check whether the agent appears stuck
    pub fn is_stuck(&self, action: &str, context_hash: &str) -> bool {
        self.record_action(action, context_hash);

        let actions: Vec<String> = {
            let inner = self.inner.lock().expect("detector poisoned");
            inner.recent.iter().map(|(a, _)| a.clone()).collect()
        };

        let pattern = self.detect_pattern(&actions);
        let stuck = pattern.loop_type != LoopType::None;
        if stuck {
            warn!(description = %pattern.description(), "Loop detected");
        }
        self.inner.lock().expect("detector poisoned").last_detected = Some(pattern);
        stuck
    }

    fn detect_pattern(&self, actions: &[String]) -> LoopPattern {
        if actions.len() < 3 {
            return LoopPattern::none();
        }

        let repetition = self.detect_repetition(actions);
        if repetition.loop_type != LoopType::None {
            return repetition;
        }

        let alternation = self.detect_alternation(actions);
        if alternation.loop_type != LoopType::None {
            return alternation;
        }

        self.detect_cycle(actions)
    }

    fn detect_repetition(&self, actions: &[String]) -> LoopPattern {
        let Some(last) = actions.last() else {
            return LoopPattern::none();
        };
        let count = actions.iter().rev().take_while(|a| *a == last).count();

        if count >= self.repetition_threshold {
            return LoopPattern {
                loop_type: LoopType::Repetition,
                pattern: vec![last.clone()],
                repetitions: count,
                confidence: (count as f64 / (self.repetition_threshold * 2) as f64).min(1.0),
                first_seen: Utc::now(),
            };
        }
        LoopPattern::none()
    }

    fn detect_alternation(&self, actions: &[String]) -> LoopPattern {
        if actions.len() < 4 {
            return LoopPattern::none();
        }

        // Only consider the recent tail
        let recent = &actions[actions.len().saturating_sub(10)..];
        let action_a = &recent[recent.len() - 1];
        let action_b = &recent[recent.len() - 2];
        if action_a == action_b {
            return LoopPattern::none();
        }

        // Count the trailing A-B-A-B run
        let mut alternations = 0;
        let mut expected = action_a;
        for action in recent.iter().rev() {
            if action == expected {
                alternations += 1;
                expected = if expected == action_a { action_b } else { action_a };
            } else {
                break;
            }
        }

        if alternations >= self.alternation_threshold {
            return LoopPattern {
                loop_type: LoopType::Alternation,
                pattern: vec![action_a.clone(), action_b.clone()],
                repetitions: alternations / 2,
                confidence: (alternations as f64 / (self.alternation_threshold * 2) as f64)
                    .min(1.0),
                first_seen: Utc::now(),
            };
        }
        LoopPattern::none()
    }

    fn detect_cycle(&self, actions: &[String]) -> LoopPattern {
        if actions.len() < 6 {
            return LoopPattern::none();
        }
        for cycle_len in 3..=5 {
            let pattern = self.find_cycle(actions, cycle_len);
            if pattern.loop_type != LoopType::None {
                return pattern;
            }
        }
        LoopPattern::none()
    }

    fn find_cycle(&self, actions: &[String], cycle_len: usize) -> LoopPattern {
        if actions.len() < cycle_len * self.cycle_threshold {
            return LoopPattern::none();
        }

        let candidate = &actions[actions.len() - cycle_len..];

        // Count how many consecutive copies of the candidate end the window
        let mut repetitions = 0;
        let mut end = actions.len();
        while end >= cycle_len {
            if &actions[end - cycle_len..end] == candidate {
                repetitions += 1;
                end -= cycle_len;
            } else {
                break;
            }
        }

        if repetitions >= self.cycle_threshold {
            return LoopPattern {
                loop_type: LoopType::Cycle,
                pattern: candidate.to_vec(),
                repetitions,
                confidence: (repetitions as f64 / (self.cycle_threshold * 2) as f64).min(1.0),
                first_seen: Utc::now(),
            };
        }
        LoopPattern::none()
    }

    /// The last detected pattern, if detection has run
    pub fn get_last_pattern(&self) -> Option<LoopPattern> {
        self.inner
            .lock()
            .expect("detector poisoned")
            .last_detected
            .clone()
    }

    /// Description of the current loop state
    pub fn get_loop_description(&self) -> String {
        self.get_last_pattern()
            .filter(|p| p.loop_type != LoopType::None)
            .map(|p| p.description())
            .unwrap_or_else(|| "No loop detected".to_string())
    }

    /// First available action not involved in the detected pattern
    pub fn suggest_break_action(&self, available_actions: &[String]) -> Option<String> {
        let pattern = self.get_last_pattern()?;
        if pattern.loop_type == LoopType::None {
            return None;
        }
        available_actions
            .iter()
            .find(|action| !pattern.pattern.contains(action))
            .cloned()
    }

    /// Drop the action history
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("detector poisoned");
        inner.recent.clear();
        inner.last_detected = None;
        debug!("LoopDetector cleared");
    }

    /// Detector statistics
    pub fn get_statistics(&self) -> LoopDetectorStats {
        let inner = self.inner.lock().expect("detector poisoned");
        let unique: std::collections::HashSet<&str> =
            inner.recent.iter().map(|(a, _)| a.as_str()).collect();
        LoopDetectorStats {
            window_size: self.window_size,
            actions_tracked: inner.recent.len(),
            unique_actions: unique.len(),
            is_stuck: inner
                .last_detected
                .as_ref()
                .is_some_and(|p| p.loop_type != LoopType::None),
        }
    }
}
