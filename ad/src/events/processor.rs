//! Event processor - routes events through middleware, hooks, and handlers
//!
//! Handlers are registered per event type and run in registration order; the
//! last handler's return value is the event result. Failures are explicit
//! [`ProcessingResult`]s rather than propagated panics, and middleware drops
//! an event by returning `None` instead of throwing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::types::{Event, EventType};

/// Error raised by a handler or middleware
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Build from anything displayable
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Result of a handler invocation: an optional value, or an explicit failure
pub type HandlerOutput = Result<Option<Value>, HandlerError>;

/// A registered event handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in statistics and results
    fn name(&self) -> &str {
        "handler"
    }

    async fn handle(&self, event: &Event) -> HandlerOutput;
}

/// Middleware may modify the event, drop it (`Ok(None)`), or fail
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, event: Event) -> Result<Option<Event>, HandlerError>;
}

struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> BoxFuture<'static, HandlerOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> HandlerOutput {
        (self.func)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(name: &str, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerOutput> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        func: move |event| func(event).boxed(),
    })
}

struct FnMiddleware<F> {
    func: F,
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(Event) -> BoxFuture<'static, Result<Option<Event>, HandlerError>> + Send + Sync,
{
    async fn call(&self, event: Event) -> Result<Option<Event>, HandlerError> {
        (self.func)(event).await
    }
}

/// Wrap an async closure as a [`Middleware`]
pub fn middleware_fn<F, Fut>(func: F) -> Arc<dyn Middleware>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Event>, HandlerError>> + Send + 'static,
{
    Arc::new(FnMiddleware {
        func: move |event| func(event).boxed(),
    })
}

type PreHook = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;
type PostHook = Arc<dyn Fn(ProcessingResult) -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorHook = Arc<dyn Fn(Event, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Result of processing a single event
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub success: bool,
    pub event: Event,
    pub value: Option<Value>,
    pub error: Option<String>,
    /// Seconds spent inside `process`
    pub processing_time: f64,
    pub handler_name: Option<String>,
}

/// Statistics for the event processor
#[derive(Debug, Clone, Default)]
pub struct ProcessorStatistics {
    pub events_processed: u64,
    pub events_succeeded: u64,
    pub events_failed: u64,
    pub events_skipped: u64,
    pub total_processing_time: f64,
    pub by_type: BTreeMap<&'static str, u64>,
    pub by_handler: BTreeMap<String, u64>,
}

/// Routes events to handlers with middleware, hooks, and error handlers
///
/// Registration is interior-mutable so the processor can be shared behind an
/// `Arc` with the running dispatch loop.
#[derive(Default)]
pub struct EventProcessor {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    default_handler: RwLock<Option<Arc<dyn EventHandler>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    pre_hooks: RwLock<Vec<PreHook>>,
    post_hooks: RwLock<Vec<PostHook>>,
    error_handlers: RwLock<Vec<ErrorHook>>,
    statistics: Mutex<ProcessorStatistics>,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type; handlers run in registration
    /// order
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(event_type = event_type.as_str(), name = handler.name(), "Registered handler");
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Set the handler used when no type-specific handler is registered
    pub fn set_default_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.default_handler.write().expect("handler registry poisoned") = Some(handler);
    }

    /// Whether any handler is registered for the type
    pub fn has_handler(&self, event_type: EventType) -> bool {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(&event_type)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Add middleware; middleware runs before hooks and handlers, in order
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware
            .write()
            .expect("handler registry poisoned")
            .push(middleware);
    }

    /// Add a hook invoked before handler dispatch; its errors are logged only
    pub fn add_pre_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.pre_hooks
            .write()
            .expect("handler registry poisoned")
            .push(Arc::new(move |event| hook(event).boxed()));
    }

    /// Add a hook invoked with the processing result; errors logged only
    pub fn add_post_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(ProcessingResult) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.post_hooks
            .write()
            .expect("handler registry poisoned")
            .push(Arc::new(move |result| hook(result).boxed()));
    }

    /// Add a handler invoked when middleware or a handler fails
    pub fn add_error_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Event, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.error_handlers
            .write()
            .expect("handler registry poisoned")
            .push(Arc::new(move |event, error| handler(event, error).boxed()));
    }

    /// Process one event through the full pipeline
    pub async fn process(&self, event: Event) -> ProcessingResult {
        let start = Instant::now();

        // Middleware chain
        let middleware: Vec<_> = self
            .middleware
            .read()
            .expect("handler registry poisoned")
            .clone();
        let mut current = event;
        for mw in middleware {
            match mw.call(current.clone()).await {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    debug!(event_type = current.event_type.as_str(), "Event dropped by middleware");
                    self.statistics
                        .lock()
                        .expect("statistics poisoned")
                        .events_skipped += 1;
                    return ProcessingResult {
                        success: true,
                        event: current,
                        value: None,
                        error: None,
                        processing_time: start.elapsed().as_secs_f64(),
                        handler_name: Some("middleware_skip".to_string()),
                    };
                }
                Err(e) => {
                    error!(error = %e, "Middleware error");
                    return self.fail(current, e.to_string(), start).await;
                }
            }
        }

        // Pre-hooks: failures logged, processing continues. Hook panics are
        // isolated by running each inside its own spawned task.
        let pre_hooks: Vec<_> = self
            .pre_hooks
            .read()
            .expect("handler registry poisoned")
            .clone();
        for hook in pre_hooks {
            if let Err(e) = tokio::spawn(hook(current.clone())).await {
                warn!(error = %e, "Pre-hook error");
            }
        }

        // Handler dispatch
        let (handlers, handler_name) = self.handlers_for(current.event_type);
        let mut value = None;
        for handler in &handlers {
            match handler.handle(&current).await {
                Ok(v) => value = v,
                Err(e) => {
                    error!(
                        event_type = current.event_type.as_str(),
                        handler = handler.name(),
                        error = %e,
                        "Handler error"
                    );
                    return self.fail(current, e.to_string(), start).await;
                }
            }
        }
        if handlers.is_empty() && handler_name == "none" {
            warn!(event_type = current.event_type.as_str(), "No handler for event type");
        }

        let processing_time = start.elapsed().as_secs_f64();
        let result = ProcessingResult {
            success: true,
            event: current,
            value,
            error: None,
            processing_time,
            handler_name: Some(handler_name.clone()),
        };

        self.record(&result.event, true, processing_time, &handler_name);

        // Post-hooks: failures logged only
        let post_hooks: Vec<_> = self
            .post_hooks
            .read()
            .expect("handler registry poisoned")
            .clone();
        for hook in post_hooks {
            if let Err(e) = tokio::spawn(hook(result.clone())).await {
                warn!(error = %e, "Post-hook error");
            }
        }

        result
    }

    /// Resolve handlers and the name used for stats: first registered
    /// handler, the default, or "none"
    fn handlers_for(&self, event_type: EventType) -> (Vec<Arc<dyn EventHandler>>, String) {
        let registry = self.handlers.read().expect("handler registry poisoned");
        if let Some(handlers) = registry.get(&event_type).filter(|h| !h.is_empty()) {
            let name = handlers[0].name().to_string();
            return (handlers.clone(), name);
        }
        drop(registry);

        match self
            .default_handler
            .read()
            .expect("handler registry poisoned")
            .clone()
        {
            Some(default) => (vec![default], "default".to_string()),
            None => (Vec::new(), "none".to_string()),
        }
    }

    async fn fail(&self, event: Event, error: String, start: Instant) -> ProcessingResult {
        let error_handlers: Vec<_> = self
            .error_handlers
            .read()
            .expect("handler registry poisoned")
            .clone();
        for handler in error_handlers {
            if let Err(e) = tokio::spawn(handler(event.clone(), error.clone())).await {
                warn!(error = %e, "Error-handler error");
            }
        }

        let processing_time = start.elapsed().as_secs_f64();
        let (_, handler_name) = self.handlers_for(event.event_type);
        self.record(&event, false, processing_time, &handler_name);

        ProcessingResult {
            success: false,
            event,
            value: None,
            error: Some(error),
            processing_time,
            handler_name: Some(handler_name),
        }
    }

    fn record(&self, event: &Event, success: bool, processing_time: f64, handler_name: &str) {
        let mut stats = self.statistics.lock().expect("statistics poisoned");
        stats.events_processed += 1;
        stats.total_processing_time += processing_time;
        if success {
            stats.events_succeeded += 1;
        } else {
            stats.events_failed += 1;
        }
        *stats.by_type.entry(event.event_type.as_str()).or_insert(0) += 1;
        *stats.by_handler.entry(handler_name.to_string()).or_insert(0) += 1;
    }

    /// Snapshot of processor statistics
    pub fn get_statistics(&self) -> ProcessorStatistics {
        self.statistics.lock().expect("statistics poisoned").clone()
    }

    /// Reset processing statistics
    pub fn clear_statistics(&self) {
        *self.statistics.lock().expect("statistics poisoned") = ProcessorStatistics::default();
    }
}

/// Accumulates events and dispatches them through the processor in batches
pub struct BatchEventProcessor {
    processor: Arc<EventProcessor>,
    batch: tokio::sync::Mutex<Vec<Event>>,
    batch_size: usize,
}

impl BatchEventProcessor {
    pub fn new(processor: Arc<EventProcessor>, batch_size: usize) -> Self {
        Self {
            processor,
            batch: tokio::sync::Mutex::new(Vec::new()),
            batch_size,
        }
    }

    /// Add an event; when the batch reaches `batch_size` it is processed and
    /// the results returned, otherwise an empty vec
    pub async fn add(&self, event: Event) -> Vec<ProcessingResult> {
        let mut batch = self.batch.lock().await;
        batch.push(event);
        if batch.len() >= self.batch_size {
            let events = std::mem::take(&mut *batch);
            drop(batch);
            self.process_events(events).await
        } else {
            Vec::new()
        }
    }

    /// Process all pending events now
    pub async fn flush(&self) -> Vec<ProcessingResult> {
        let events = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        self.process_events(events).await
    }

    async fn process_events(&self, events: Vec<Event>) -> Vec<ProcessingResult> {
        let mut results = Vec::with_capacity(events.len());
        for event in events {
            results.push(self.processor.process(event).await);
        }
        results
    }

    /// Number of events waiting in the batch
    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventPriority, EventSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message_event() -> Event {
        Event::message("hello", "test", None)
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let processor = EventProcessor::new();
        processor.register_handler(
            EventType::Message,
            handler_fn("echo", |event| async move {
                Ok(event.payload.get("content").cloned())
            }),
        );

        let result = processor.process(message_event()).await;
        assert!(result.success);
        assert_eq!(result.value, Some(serde_json::json!("hello")));
        assert_eq!(result.handler_name.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_last_handler_wins() {
        let processor = EventProcessor::new();
        processor.register_handler(
            EventType::Message,
            handler_fn("first", |_| async { Ok(Some(serde_json::json!(1))) }),
        );
        processor.register_handler(
            EventType::Message,
            handler_fn("second", |_| async { Ok(Some(serde_json::json!(2))) }),
        );

        let result = processor.process(message_event()).await;
        assert_eq!(result.value, Some(serde_json::json!(2)));
        // Stats name the first handler for the type
        assert_eq!(result.handler_name.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_default_handler_and_none() {
        let processor = EventProcessor::new();

        let result = processor.process(message_event()).await;
        assert!(result.success);
        assert!(result.value.is_none());
        assert_eq!(result.handler_name.as_deref(), Some("none"));

        processor.set_default_handler(handler_fn("fallback", |_| async {
            Ok(Some(serde_json::json!("default")))
        }));
        let result = processor.process(message_event()).await;
        assert_eq!(result.value, Some(serde_json::json!("default")));
        assert_eq!(result.handler_name.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_middleware_modifies_event() {
        let processor = EventProcessor::new();
        processor.add_middleware(middleware_fn(|mut event: Event| async move {
            event
                .payload
                .insert("tagged".into(), serde_json::json!(true));
            Ok(Some(event))
        }));
        processor.register_handler(
            EventType::Message,
            handler_fn("read_tag", |event| async move {
                Ok(event.payload.get("tagged").cloned())
            }),
        );

        let result = processor.process(message_event()).await;
        assert_eq!(result.value, Some(serde_json::json!(true)));
    }

    #[tokio::test]
    async fn test_middleware_drop_skips_event() {
        let processor = EventProcessor::new();
        let invoked = Arc::new(AtomicUsize::new(0));
        processor.add_middleware(middleware_fn(|_| async { Ok(None) }));
        {
            let invoked = invoked.clone();
            processor.register_handler(
                EventType::Message,
                handler_fn("never", move |_| {
                    let invoked = invoked.clone();
                    async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                }),
            );
        }

        let result = processor.process(message_event()).await;
        assert!(result.success);
        assert_eq!(result.handler_name.as_deref(), Some("middleware_skip"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(processor.get_statistics().events_skipped, 1);
        assert_eq!(processor.get_statistics().events_processed, 0);
    }

    #[tokio::test]
    async fn test_handler_error_invokes_error_handlers() {
        let processor = EventProcessor::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        {
            let seen = seen.clone();
            processor.add_error_handler(move |_event, error| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(error);
                }
            });
        }
        processor.register_handler(
            EventType::Message,
            handler_fn("boom", |_| async { Err(HandlerError::msg("kaput")) }),
        );

        let result = processor.process(message_event()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("kaput"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["kaput"]);

        let stats = processor.get_statistics();
        assert_eq!(stats.events_failed, 1);
        assert_eq!(stats.events_processed, 1);
    }

    #[tokio::test]
    async fn test_hook_panic_does_not_stop_processing() {
        let processor = EventProcessor::new();
        processor.add_pre_hook(|_| async { panic!("pre hook panic") });
        processor.register_handler(
            EventType::Message,
            handler_fn("ok", |_| async { Ok(Some(serde_json::json!("ran"))) }),
        );

        let result = processor.process(message_event()).await;
        assert!(result.success);
        assert_eq!(result.value, Some(serde_json::json!("ran")));
    }

    #[tokio::test]
    async fn test_hooks_observe_events_and_results() {
        let processor = EventProcessor::new();
        let pre_count = Arc::new(AtomicUsize::new(0));
        let post_ok = Arc::new(AtomicUsize::new(0));
        {
            let pre_count = pre_count.clone();
            processor.add_pre_hook(move |_| {
                let pre_count = pre_count.clone();
                async move {
                    pre_count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        {
            let post_ok = post_ok.clone();
            processor.add_post_hook(move |result| {
                let post_ok = post_ok.clone();
                async move {
                    if result.success {
                        post_ok.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        processor.process(message_event()).await;
        assert_eq!(pre_count.load(Ordering::SeqCst), 1);
        assert_eq!(post_ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_statistics_accumulate() {
        let processor = EventProcessor::new();
        processor.register_handler(
            EventType::Message,
            handler_fn("ok", |_| async { Ok(None) }),
        );

        processor.process(message_event()).await;
        processor
            .process(Event::new(
                EventType::Custom,
                EventPriority::Low,
                EventSource::Internal,
            ))
            .await;

        let stats = processor.get_statistics();
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.events_succeeded, 2);
        assert_eq!(stats.by_type["message"], 1);
        assert_eq!(stats.by_type["custom"], 1);
        assert_eq!(stats.by_handler["ok"], 1);
        assert_eq!(stats.by_handler["none"], 1);

        processor.clear_statistics();
        assert_eq!(processor.get_statistics().events_processed, 0);
    }

    #[tokio::test]
    async fn test_batch_processor_flushes_on_threshold() {
        let processor = Arc::new(EventProcessor::new());
        processor.register_handler(
            EventType::Message,
            handler_fn("ok", |_| async { Ok(Some(serde_json::json!("done"))) }),
        );
        let batch = BatchEventProcessor::new(processor, 2);

        assert!(batch.add(message_event()).await.is_empty());
        assert_eq!(batch.pending().await, 1);

        let results = batch.add(message_event()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(batch.pending().await, 0);
    }

    #[tokio::test]
    async fn test_batch_processor_manual_flush() {
        let processor = Arc::new(EventProcessor::new());
        let batch = BatchEventProcessor::new(processor, 100);
        batch.add(message_event()).await;
        let results = batch.flush().await;
        assert_eq!(results.len(), 1);
    }
}
