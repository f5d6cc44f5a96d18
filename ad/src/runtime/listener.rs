//! Event listeners - external sources that push onto the queue
//!
//! A listener is anything with `start`/`stop`/`push_event`. The runtime ships
//! two: a callback listener for programmatic injection and an HTTP webhook
//! listener. External sources must go through a listener rather than touching
//! the queue directly so per-listener statistics stay consistent.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::{DateTime, Utc};
use eyre::Context;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventQueue};

/// Statistics for an event listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub events_received: u64,
    pub events_forwarded: u64,
    pub errors: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub is_running: bool,
}

/// A source of events that pushes onto the runtime queue
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Listener name for logging and statistics keys
    fn name(&self) -> &str;

    /// Start listening
    async fn start(&self) -> eyre::Result<()>;

    /// Stop listening
    async fn stop(&self);

    /// Push an event onto the bound queue
    async fn push_event(&self, event: Event);

    /// Current statistics
    fn statistics(&self) -> ListenerStats;

    /// Whether the listener is running
    fn is_running(&self) -> bool;
}

/// Shared plumbing for listener implementations
struct ListenerCore {
    name: String,
    queue: Arc<EventQueue>,
    stats: Mutex<ListenerStats>,
    running: AtomicBool,
}

impl ListenerCore {
    fn new(name: &str, queue: Arc<EventQueue>) -> Self {
        Self {
            name: name.to_string(),
            queue,
            stats: Mutex::new(ListenerStats::default()),
            running: AtomicBool::new(false),
        }
    }

    fn mark_started(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.stats.lock().expect("listener stats poisoned").started_at = Some(Utc::now());
    }

    fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn record_received(&self) {
        self.stats
            .lock()
            .expect("listener stats poisoned")
            .events_received += 1;
    }

    fn record_error(&self) {
        self.stats.lock().expect("listener stats poisoned").errors += 1;
    }

    async fn forward(&self, event: Event) {
        debug!(listener = %self.name, event_type = event.event_type.as_str(), "Event pushed");
        self.queue.put(event).await;
        let mut stats = self.stats.lock().expect("listener stats poisoned");
        stats.events_forwarded += 1;
        stats.last_event_at = Some(Utc::now());
    }

    fn statistics(&self) -> ListenerStats {
        let mut stats = self.stats.lock().expect("listener stats poisoned").clone();
        stats.is_running = self.running.load(Ordering::SeqCst);
        stats
    }
}

/// Synchronous observer notified on every injected event
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Listener for programmatic event injection
///
/// The runtime routes `emit` through one of these so emitted events show up
/// in listener statistics like any external source.
pub struct CallbackListener {
    core: ListenerCore,
    callbacks: Mutex<Vec<EventCallback>>,
}

impl CallbackListener {
    pub fn new(queue: Arc<EventQueue>, name: &str) -> Self {
        Self {
            core: ListenerCore::new(name, queue),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Inject an event; dropped (with a warning) when the listener is not
    /// started
    pub async fn inject(&self, event: Event) {
        if !self.core.running.load(Ordering::SeqCst) {
            warn!(listener = %self.core.name, "Listener not running, event dropped");
            return;
        }
        self.core.record_received();

        let callbacks: Vec<EventCallback> =
            self.callbacks.lock().expect("callbacks poisoned").clone();
        for callback in callbacks {
            callback(&event);
        }

        self.core.forward(event).await;
    }

    /// Register a synchronous callback observing injected events
    pub fn add_callback(&self, callback: EventCallback) {
        self.callbacks.lock().expect("callbacks poisoned").push(callback);
    }
}

#[async_trait]
impl EventListener for CallbackListener {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn start(&self) -> eyre::Result<()> {
        self.core.mark_started();
        debug!(listener = %self.core.name, "Callback listener started");
        Ok(())
    }

    async fn stop(&self) {
        self.core.mark_stopped();
        debug!(listener = %self.core.name, "Callback listener stopped");
    }

    async fn push_event(&self, event: Event) {
        self.core.forward(event).await;
    }

    fn statistics(&self) -> ListenerStats {
        self.core.statistics()
    }

    fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }
}

/// HTTP webhook listener
///
/// Accepts POST bodies on the configured path, enforces an optional bearer
/// token, and maps each request into a webhook event. Bodies that are not
/// JSON are carried as `{"raw": "..."}`.
pub struct WebhookListener {
    shared: Arc<WebhookShared>,
    host: String,
    port: u16,
    server: Mutex<Option<(JoinHandle<()>, tokio::sync::oneshot::Sender<()>)>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct WebhookShared {
    core: ListenerCore,
    path: String,
    auth_token: Option<String>,
}

impl WebhookListener {
    pub fn new(
        queue: Arc<EventQueue>,
        host: &str,
        port: u16,
        path: &str,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            shared: Arc::new(WebhookShared {
                core: ListenerCore::new("webhook", queue),
                path: path.to_string(),
                auth_token,
            }),
            host: host.to_string(),
            port,
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The address the server actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr poisoned")
    }

    async fn handle(
        State(shared): State<Arc<WebhookShared>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> (StatusCode, &'static str) {
        // Bearer-token check
        if let Some(token) = &shared.auth_token {
            let expected = format!("Bearer {token}");
            let presented = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if presented != expected {
                warn!("Webhook authentication failed");
                return (StatusCode::UNAUTHORIZED, "Unauthorized");
            }
        }

        shared.core.record_received();

        let data = match serde_json::from_slice::<Value>(&body) {
            Ok(value) => value,
            Err(_) => serde_json::json!({
                "raw": String::from_utf8_lossy(&body).to_string(),
            }),
        };
        let header_map: BTreeMap<String, String> = headers
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();

        let event = Event::webhook(&shared.path, data, header_map);
        shared.core.forward(event).await;

        (StatusCode::OK, "OK")
    }
}

#[async_trait]
impl EventListener for WebhookListener {
    fn name(&self) -> &str {
        &self.shared.core.name
    }

    async fn start(&self) -> eyre::Result<()> {
        if self.is_running() {
            warn!("Webhook listener already running");
            return Ok(());
        }

        let app = Router::new()
            .route(&self.shared.path, post(Self::handle))
            .with_state(self.shared.clone());

        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .context("Failed to bind webhook listener")?;
        let local = listener.local_addr().context("Failed to read bound address")?;
        *self.local_addr.lock().expect("addr poisoned") = Some(local);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "Webhook server error");
            }
        });

        *self.server.lock().expect("server poisoned") = Some((handle, shutdown_tx));
        self.shared.core.mark_started();
        info!(%local, path = %self.shared.path, "Webhook listener started");
        Ok(())
    }

    async fn stop(&self) {
        let server = self.server.lock().expect("server poisoned").take();
        if let Some((handle, shutdown_tx)) = server {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
        self.shared.core.mark_stopped();
        info!("Webhook listener stopped");
    }

    async fn push_event(&self, event: Event) {
        self.shared.core.forward(event).await;
    }

    fn statistics(&self) -> ListenerStats {
        self.shared.core.statistics()
    }

    fn is_running(&self) -> bool {
        self.shared.core.running.load(Ordering::SeqCst)
    }
}

/// Manages a set of listeners as one unit
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn add(&self, listener: Arc<dyn EventListener>) {
        debug!(listener = listener.name(), "Added listener");
        self.listeners.lock().expect("listeners poisoned").push(listener);
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.lock().expect("listeners poisoned").clone()
    }

    /// Start every listener; individual failures are logged and skipped
    pub async fn start_all(&self) {
        let listeners = self.snapshot();
        let count = listeners.len();
        for listener in listeners {
            if let Err(e) = listener.start().await {
                error!(listener = listener.name(), error = %e, "Failed to start listener");
            }
        }
        info!(count, "Started event listeners");
    }

    /// Stop every listener
    pub async fn stop_all(&self) {
        for listener in self.snapshot() {
            listener.stop().await;
        }
        info!("All event listeners stopped");
    }

    /// Statistics keyed by listener name
    pub fn statistics(&self) -> BTreeMap<String, ListenerStats> {
        self.snapshot()
            .iter()
            .map(|l| (l.name().to_string(), l.statistics()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_post(
        addr: SocketAddr,
        path: &str,
        body: &str,
        auth: Option<&str>,
    ) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let auth_header = auth
            .map(|token| format!("Authorization: Bearer {token}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\n{auth_header}Connection: close\r\n\r\n{body}",
            body.len(),
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_callback_listener_forwards_and_notifies() {
        let queue = Arc::new(EventQueue::new());
        let listener = CallbackListener::new(queue.clone(), "test");
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            listener.add_callback(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Not started: event dropped
        listener.inject(Event::message("lost", "test", None)).await;
        assert_eq!(queue.qsize(), 0);

        listener.start().await.unwrap();
        listener.inject(Event::message("kept", "test", None)).await;

        assert_eq!(queue.qsize(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let stats = listener.statistics();
        assert_eq!(stats.events_received, 1);
        assert_eq!(stats.events_forwarded, 1);
        assert!(stats.is_running);
        assert!(stats.last_event_at.is_some());

        listener.stop().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_webhook_accepts_json_post() {
        let queue = Arc::new(EventQueue::new());
        let listener = WebhookListener::new(queue.clone(), "127.0.0.1", 0, "/webhook", None);
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let response = http_post(addr, "/webhook", r#"{"kind":"ping"}"#, None).await;
        assert!(response.contains("200 OK"));

        let event = queue.get(true).await;
        assert_eq!(event.event_type, EventType::Webhook);
        assert_eq!(event.payload["data"]["kind"], serde_json::json!("ping"));
        assert_eq!(event.payload["endpoint"], serde_json::json!("/webhook"));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_webhook_raw_body_fallback() {
        let queue = Arc::new(EventQueue::new());
        let listener = WebhookListener::new(queue.clone(), "127.0.0.1", 0, "/webhook", None);
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let response = http_post(addr, "/webhook", "plain text here", None).await;
        assert!(response.contains("200 OK"));

        let event = queue.get(true).await;
        assert_eq!(
            event.payload["data"]["raw"],
            serde_json::json!("plain text here")
        );

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_webhook_bearer_auth() {
        let queue = Arc::new(EventQueue::new());
        let listener = WebhookListener::new(
            queue.clone(),
            "127.0.0.1",
            0,
            "/webhook",
            Some("sekrit".to_string()),
        );
        listener.start().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let denied = http_post(addr, "/webhook", "{}", None).await;
        assert!(denied.contains("401"));

        let wrong = http_post(addr, "/webhook", "{}", Some("wrong")).await;
        assert!(wrong.contains("401"));

        let allowed = http_post(addr, "/webhook", "{}", Some("sekrit")).await;
        assert!(allowed.contains("200 OK"));

        assert_eq!(queue.qsize(), 1);
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_listener_set_lifecycle() {
        let queue = Arc::new(EventQueue::new());
        let set = ListenerSet::new();
        let a = Arc::new(CallbackListener::new(queue.clone(), "a"));
        let b = Arc::new(CallbackListener::new(queue.clone(), "b"));
        set.add(a.clone());
        set.add(b.clone());

        set.start_all().await;
        assert!(a.is_running() && b.is_running());

        let stats = set.statistics();
        assert_eq!(stats.len(), 2);
        assert!(stats["a"].is_running);

        set.stop_all().await;
        assert!(!a.is_running() && !b.is_running());
    }
}
