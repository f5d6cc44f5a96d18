//! Human handoff - request help from a human and wait for the answer
//!
//! Requests are dispatched through a channel handler (console by default) and
//! awaited with a timeout. Responses arrive via `provide_response`, keyed by
//! request id; `cancel_request` unblocks a waiter early.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channels a help request can be delivered over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffChannel {
    Telegram,
    Slack,
    Discord,
    Email,
    Console,
    Callback,
}

/// Urgency of a help request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestUrgency {
    /// Can wait indefinitely
    Low,
    /// Should be answered within hours
    Medium,
    /// Should be answered within minutes
    High,
    /// Immediate response needed
    Critical,
}

impl RequestUrgency {
    fn label(self) -> &'static str {
        match self {
            RequestUrgency::Low => "LOW",
            RequestUrgency::Medium => "MEDIUM",
            RequestUrgency::High => "HIGH",
            RequestUrgency::Critical => "CRITICAL",
        }
    }
}

/// A request for human assistance
#[derive(Debug, Clone, Serialize)]
pub struct HumanRequest {
    pub id: String,
    pub question: String,
    pub context: BTreeMap<String, Value>,
    pub urgency: RequestUrgency,
    pub options: Vec<String>,
    pub timeout_seconds: f64,
    pub created_at: DateTime<Utc>,
    pub channel: HandoffChannel,
}

impl HumanRequest {
    /// Format as a human-readable message for channel delivery
    pub fn format_message(&self) -> String {
        let mut msg = format!("[{}] Help Request\n\n", self.urgency.label());
        msg.push_str(&format!("Question: {}\n", self.question));

        if !self.options.is_empty() {
            msg.push_str("\nOptions:\n");
            for (i, option) in self.options.iter().enumerate() {
                msg.push_str(&format!("  [{}] {option}\n", i + 1));
            }
        }
        if !self.context.is_empty() {
            msg.push_str("\nContext:\n");
            for (key, value) in &self.context {
                msg.push_str(&format!("  - {key}: {value}\n"));
            }
        }
        msg
    }
}

/// A response from a human
#[derive(Debug, Clone, Serialize)]
pub struct HumanResponse {
    pub request_id: String,
    pub response: String,
    pub selected_option: Option<usize>,
    pub responded_at: DateTime<Utc>,
    pub responder: Option<String>,
}

/// Handler that delivers a request over a channel; delivery is best-effort
/// and no correctness claim depends on it succeeding
pub type ChannelHandler = Arc<dyn Fn(&HumanRequest) + Send + Sync>;

/// Handoff statistics
#[derive(Debug, Clone, Serialize)]
pub struct HandoffStats {
    pub pending_requests: usize,
    pub total_requests: usize,
    pub total_responses: usize,
}

/// Dispatches help requests and matches responses to waiters
pub struct HumanHandoff {
    default_channel: HandoffChannel,
    default_timeout: f64,
    channel_handlers: Mutex<HashMap<HandoffChannel, ChannelHandler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Option<HumanResponse>>>>,
    request_history: Mutex<Vec<HumanRequest>>,
    response_history: Mutex<Vec<HumanResponse>>,
}

impl HumanHandoff {
    pub fn new(default_channel: HandoffChannel, default_timeout: f64) -> Self {
        debug!(?default_channel, "HumanHandoff initialized");
        Self {
            default_channel,
            default_timeout,
            channel_handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            request_history: Mutex::new(Vec::new()),
            response_history: Mutex::new(Vec::new()),
        }
    }

    /// Register a delivery handler for a channel
    pub fn register_channel_handler(&self, channel: HandoffChannel, handler: ChannelHandler) {
        self.channel_handlers
            .lock()
            .expect("handlers poisoned")
            .insert(channel, handler);
        debug!(?channel, "Registered channel handler");
    }

    /// Send a help request and wait for a response or timeout
    #[allow(clippy::too_many_arguments)]
    pub async fn request_help(
        &self,
        question: &str,
        context: BTreeMap<String, Value>,
        urgency: RequestUrgency,
        options: Vec<String>,
        timeout: Option<f64>,
        channel: Option<HandoffChannel>,
    ) -> Option<HumanResponse> {
        let request = HumanRequest {
            id: {
                let hex = Uuid::now_v7().simple().to_string();
                hex[..8].to_string()
            },
            question: question.to_string(),
            context,
            urgency,
            options,
            timeout_seconds: timeout.unwrap_or(self.default_timeout),
            created_at: Utc::now(),
            channel: channel.unwrap_or(self.default_channel),
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(request.id.clone(), tx);
        self.request_history
            .lock()
            .expect("history poisoned")
            .push(request.clone());

        self.dispatch(&request);
        info!(id = %request.id, urgency = urgency.label(), "Help requested");

        let wait = Duration::from_secs_f64(request.timeout_seconds);
        let response = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => response,
            _ => {
                warn!(id = %request.id, "Help request timed out");
                None
            }
        };

        self.pending.lock().expect("pending poisoned").remove(&request.id);
        response
    }

    fn dispatch(&self, request: &HumanRequest) {
        let handler = self
            .channel_handlers
            .lock()
            .expect("handlers poisoned")
            .get(&request.channel)
            .cloned();
        match handler {
            Some(handler) => handler(request),
            // Console is the default channel: print to stderr
            None if request.channel == HandoffChannel::Console => {
                eprintln!("{}", request.format_message());
            }
            None => warn!(channel = ?request.channel, "No handler for handoff channel"),
        }
    }

    /// Provide the human's answer; returns false when no waiter matches
    pub fn provide_response(
        &self,
        request_id: &str,
        response: &str,
        selected_option: Option<usize>,
        responder: Option<&str>,
    ) -> bool {
        let human_response = HumanResponse {
            request_id: request_id.to_string(),
            response: response.to_string(),
            selected_option,
            responded_at: Utc::now(),
            responder: responder.map(str::to_string),
        };
        self.response_history
            .lock()
            .expect("history poisoned")
            .push(human_response.clone());

        let sender = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => tx.send(Some(human_response)).is_ok(),
            None => false,
        }
    }

    /// Unblock a waiter without an answer; returns false when unknown
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(None);
                true
            }
            None => false,
        }
    }

    /// Ids of requests currently awaiting a response
    pub fn pending_requests(&self) -> Vec<String> {
        self.pending
            .lock()
            .expect("pending poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Drop all tracking; pending waiters are cancelled
    pub fn clear(&self) {
        let pending: Vec<oneshot::Sender<Option<HumanResponse>>> = self
            .pending
            .lock()
            .expect("pending poisoned")
            .drain()
            .map(|(_, tx)| tx)
            .collect();
        for tx in pending {
            let _ = tx.send(None);
        }
        self.request_history.lock().expect("history poisoned").clear();
        self.response_history.lock().expect("history poisoned").clear();
        debug!("HumanHandoff cleared");
    }

    /// Handoff statistics
    pub fn get_statistics(&self) -> HandoffStats {
        HandoffStats {
            pending_requests: self.pending.lock().expect("pending poisoned").len(),
            total_requests: self.request_history.lock().expect("history poisoned").len(),
            total_responses: self
                .response_history
                .lock()
                .expect("history poisoned")
                .len(),
        }
    }
}

impl Default for HumanHandoff {
    fn default() -> Self {
        Self::new(HandoffChannel::Console, 3600.0)
    }
}
