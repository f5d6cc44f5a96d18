//! Event types for the runtime queue
//!
//! Events are the fundamental unit of work in the event-driven runtime. They
//! are prioritized, optionally deadlined, and carry opaque payload maps that
//! each handler validates for itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Types of events the runtime recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // External triggers
    Webhook,
    Message,
    Schedule,

    // Internal triggers
    GoalDeadline,
    SubgoalComplete,
    ActionFailed,
    ActionSucceeded,

    // Background processes
    MemoryConsolidation,
    HealthCheck,
    LearningUpdate,

    // System events
    Startup,
    Shutdown,
    Error,
    Intervention,

    // User-defined
    Custom,
}

impl EventType {
    /// Wire name of this event type
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Webhook => "webhook",
            EventType::Message => "message",
            EventType::Schedule => "schedule",
            EventType::GoalDeadline => "goal_deadline",
            EventType::SubgoalComplete => "subgoal_complete",
            EventType::ActionFailed => "action_failed",
            EventType::ActionSucceeded => "action_succeeded",
            EventType::MemoryConsolidation => "memory_consolidation",
            EventType::HealthCheck => "health_check",
            EventType::LearningUpdate => "learning_update",
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
            EventType::Error => "error",
            EventType::Intervention => "intervention",
            EventType::Custom => "custom",
        }
    }
}

/// Priority levels for events (lower value = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    /// System-critical, process immediately
    Critical = 0,
    /// Goal deadlines, interventions
    High = 1,
    /// User messages, webhooks
    Normal = 2,
    /// Scheduled tasks
    Low = 3,
    /// Background processes
    Background = 4,
}

impl EventPriority {
    /// Numeric wire value
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Parse from the numeric wire value
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(EventPriority::Critical),
            1 => Some(EventPriority::High),
            2 => Some(EventPriority::Normal),
            3 => Some(EventPriority::Low),
            4 => Some(EventPriority::Background),
            _ => None,
        }
    }

    /// Display name for statistics keys
    pub fn name(self) -> &'static str {
        match self {
            EventPriority::Critical => "critical",
            EventPriority::High => "high",
            EventPriority::Normal => "normal",
            EventPriority::Low => "low",
            EventPriority::Background => "background",
        }
    }
}

impl Serialize for EventPriority {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for EventPriority {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        EventPriority::from_value(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid event priority: {value}")))
    }
}

/// Where an event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Webhooks, messages
    External,
    /// Scheduler-triggered
    Scheduled,
    /// Goal-related
    Goal,
    /// System-internal
    Internal,
    /// Background processes
    Background,
}

/// A single unit of work in the runtime queue
///
/// Two events are equal iff their `event_id` matches; ordering compares
/// `(priority, created_at)` so the queue dispatches priority-first, FIFO
/// within one priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub priority: EventPriority,
    pub source: EventSource,
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Event {
    /// Build an event with explicit type, priority, and source
    pub fn new(event_type: EventType, priority: EventPriority, source: EventSource) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            event_type,
            priority,
            source,
            payload: BTreeMap::new(),
            deadline: None,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a payload entry
    pub fn with_payload(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Attach a deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Whether the event has passed its deadline
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Utc::now() > deadline)
    }

    /// Seconds until the deadline, or `None` if there is none
    pub fn time_until_deadline(&self) -> Option<f64> {
        self.deadline
            .map(|deadline| (deadline - Utc::now()).num_milliseconds() as f64 / 1000.0)
    }

    // === Factory constructors for common shapes ===

    /// A received message
    pub fn message(content: &str, channel: &str, sender: Option<&str>) -> Self {
        Event::new(EventType::Message, EventPriority::Normal, EventSource::External)
            .with_payload("content", Value::String(content.to_string()))
            .with_payload("channel", Value::String(channel.to_string()))
            .with_payload(
                "sender",
                sender.map_or(Value::Null, |s| Value::String(s.to_string())),
            )
    }

    /// A received webhook
    pub fn webhook(endpoint: &str, data: Value, headers: BTreeMap<String, String>) -> Self {
        Event::new(EventType::Webhook, EventPriority::Normal, EventSource::External)
            .with_payload("endpoint", Value::String(endpoint.to_string()))
            .with_payload("data", data)
            .with_payload(
                "headers",
                serde_json::to_value(headers).unwrap_or(Value::Null),
            )
    }

    /// A scheduled-task trigger
    pub fn scheduled(task_id: &str, task_name: &str, task_payload: Value) -> Self {
        Event::new(EventType::Schedule, EventPriority::Low, EventSource::Scheduled)
            .with_payload("task_id", Value::String(task_id.to_string()))
            .with_payload("task_name", Value::String(task_name.to_string()))
            .with_payload("task_payload", task_payload)
    }

    /// A goal-deadline event, expiring at the deadline itself
    pub fn goal_deadline(goal_id: &str, goal_description: &str, deadline: DateTime<Utc>) -> Self {
        Event::new(EventType::GoalDeadline, EventPriority::High, EventSource::Goal)
            .with_payload("goal_id", Value::String(goal_id.to_string()))
            .with_payload(
                "goal_description",
                Value::String(goal_description.to_string()),
            )
            .with_deadline(deadline)
    }

    /// An action outcome event; failures dispatch at high priority
    pub fn action_result(action: &str, success: bool, result: Value, error: Option<&str>) -> Self {
        let (event_type, priority) = if success {
            (EventType::ActionSucceeded, EventPriority::Normal)
        } else {
            (EventType::ActionFailed, EventPriority::High)
        };
        Event::new(event_type, priority, EventSource::Internal)
            .with_payload("action", Value::String(action.to_string()))
            .with_payload("success", Value::Bool(success))
            .with_payload("result", result)
            .with_payload(
                "error",
                error.map_or(Value::Null, |e| Value::String(e.to_string())),
            )
    }

    /// A background-process event
    pub fn background(event_type: EventType, payload: BTreeMap<String, Value>) -> Self {
        let mut event = Event::new(
            event_type,
            EventPriority::Background,
            EventSource::Background,
        );
        event.payload = payload;
        event
    }

    /// A system event at the given priority
    pub fn system(event_type: EventType, priority: EventPriority) -> Self {
        Event::new(event_type, priority, EventSource::Internal)
    }

    /// An error event
    pub fn error(error_type: &str, message: &str) -> Self {
        Event::new(EventType::Error, EventPriority::High, EventSource::Internal)
            .with_payload("error_type", Value::String(error_type.to_string()))
            .with_payload("message", Value::String(message.to_string()))
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.event_id.hash(state);
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower priority value dispatches first, then earlier creation
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ordering_priority_first() {
        let high = Event::new(EventType::GoalDeadline, EventPriority::High, EventSource::Goal);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let normal = Event::new(EventType::Message, EventPriority::Normal, EventSource::External);

        // Smaller = dispatched first
        assert!(high < normal);
    }

    #[test]
    fn test_ordering_fifo_within_priority() {
        let first = Event::new(EventType::Message, EventPriority::Normal, EventSource::External);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Event::new(EventType::Message, EventPriority::Normal, EventSource::External);

        assert!(first < second);
    }

    #[test]
    fn test_equality_by_id_only() {
        let a = Event::new(EventType::Message, EventPriority::Normal, EventSource::External);
        let mut b = a.clone();
        b.priority = EventPriority::Critical;
        assert_eq!(a, b);

        let c = Event::new(EventType::Message, EventPriority::Normal, EventSource::External);
        assert_ne!(a, c);
    }

    #[test]
    fn test_expiry() {
        let mut event = Event::message("hi", "test", None);
        assert!(!event.is_expired());
        assert!(event.time_until_deadline().is_none());

        event.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(event.is_expired());
        assert!(event.time_until_deadline().unwrap() < 0.0);
    }

    #[test]
    fn test_factories() {
        let msg = Event::message("hello", "slack", Some("ada"));
        assert_eq!(msg.event_type, EventType::Message);
        assert_eq!(msg.priority, EventPriority::Normal);
        assert_eq!(msg.source, EventSource::External);
        assert_eq!(msg.payload["content"], serde_json::json!("hello"));

        let sched = Event::scheduled("task-1", "nightly", serde_json::json!({"k": 1}));
        assert_eq!(sched.event_type, EventType::Schedule);
        assert_eq!(sched.priority, EventPriority::Low);
        assert_eq!(sched.source, EventSource::Scheduled);

        let failed = Event::action_result("post", false, Value::Null, Some("boom"));
        assert_eq!(failed.event_type, EventType::ActionFailed);
        assert_eq!(failed.priority, EventPriority::High);

        let ok = Event::action_result("post", true, Value::Null, None);
        assert_eq!(ok.event_type, EventType::ActionSucceeded);
        assert_eq!(ok.priority, EventPriority::Normal);
    }

    #[test]
    fn test_serde_wire_names() {
        let event = Event::system(EventType::GoalDeadline, EventPriority::High);
        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"type\":\"goal_deadline\""));
        assert!(raw.contains("\"priority\":1"));
        assert!(raw.contains("\"source\":\"internal\""));
    }

    proptest! {
        #[test]
        fn prop_event_roundtrip(priority in 0u8..5, deadline_offset in -3600i64..3600) {
            let mut event = Event::new(
                EventType::Custom,
                EventPriority::from_value(priority).unwrap(),
                EventSource::Internal,
            );
            event.deadline = Some(Utc::now() + chrono::Duration::seconds(deadline_offset));
            event.payload.insert("k".into(), serde_json::json!([1, 2, 3]));

            let raw = serde_json::to_string(&event).unwrap();
            let parsed: Event = serde_json::from_str(&raw).unwrap();

            prop_assert_eq!(&parsed, &event);
            prop_assert_eq!(parsed.priority, event.priority);
            prop_assert_eq!(parsed.deadline, event.deadline);
            prop_assert_eq!(parsed.payload, event.payload);
        }
    }
}
