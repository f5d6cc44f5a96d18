//! Priority event queue
//!
//! A min-heap keyed on `(priority, created_at, seq)` with a pause latch and
//! join accounting. `get` parks on a [`Notify`] until an event is available
//! and the queue is unpaused; `put` parks until capacity frees when the queue
//! is bounded.

use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::types::{Event, EventPriority};

/// Returned by `put_nowait` when a bounded queue is at capacity
#[derive(Debug, Error)]
#[error("event queue full")]
pub struct QueueFull(pub Event);

/// Statistics about the event queue
#[derive(Debug, Clone, Default)]
pub struct QueueStatistics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_expired: u64,
    pub current_size: usize,
    pub by_priority: BTreeMap<&'static str, u64>,
    pub by_type: BTreeMap<&'static str, u64>,
}

/// Heap entry; the sequence number makes FIFO deterministic when two events
/// share a priority and creation instant
struct QueuedEvent {
    event: Event,
    seq: u64,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the smallest key pops first
        other
            .event
            .cmp(&self.event)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedEvent>,
    seq: u64,
    unfinished: usize,
    paused: bool,
    /// 0 = unbounded
    maxsize: usize,
    stats: QueueStatistics,
}

/// Priority queue for events
///
/// Events dequeue in priority order (lower priority value first), FIFO within
/// the same priority. Expired events are discarded at dequeue time when
/// `skip_expired` is set.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    /// Wakes getters on put and on resume
    notify: Notify,
    /// Wakes bounded putters when capacity frees
    space_notify: Notify,
    /// Wakes `join` when the unfinished count reaches zero
    done_notify: Notify,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an unbounded, unpaused queue
    pub fn new() -> Self {
        Self::with_maxsize(0)
    }

    /// Create a queue holding at most `maxsize` events (0 = unbounded)
    pub fn with_maxsize(maxsize: usize) -> Self {
        debug!(maxsize, "EventQueue initialized");
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                seq: 0,
                unfinished: 0,
                paused: false,
                maxsize,
                stats: QueueStatistics::default(),
            }),
            notify: Notify::new(),
            space_notify: Notify::new(),
            done_notify: Notify::new(),
        }
    }

    /// Add an event, waiting for capacity when the queue is bounded
    pub async fn put(&self, event: Event) {
        let mut event = event;
        loop {
            let notified = self.space_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.put_nowait(event) {
                Ok(()) => return,
                Err(QueueFull(returned)) => event = returned,
            }
            notified.await;
        }
    }

    /// Add an event without waiting; fails when a bounded queue is full
    pub fn put_nowait(&self, event: Event) -> Result<(), QueueFull> {
        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            if inner.maxsize > 0 && inner.heap.len() >= inner.maxsize {
                return Err(QueueFull(event));
            }
            inner.stats.total_enqueued += 1;
            *inner
                .stats
                .by_priority
                .entry(event.priority.name())
                .or_insert(0) += 1;
            *inner
                .stats
                .by_type
                .entry(event.event_type.as_str())
                .or_insert(0) += 1;
            debug!(
                event_type = event.event_type.as_str(),
                priority = event.priority.name(),
                "Event enqueued"
            );
            let seq = inner.seq;
            inner.seq += 1;
            inner.unfinished += 1;
            inner.heap.push(QueuedEvent { event, seq });
        }
        self.notify.notify_one();
        Ok(())
    }

    fn pop_locked(inner: &mut QueueInner) -> Option<Event> {
        let popped = inner.heap.pop().map(|qe| qe.event);
        if popped.is_some() {
            inner.stats.total_dequeued += 1;
        }
        popped
    }

    fn try_pop(&self) -> Option<Event> {
        let popped = {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            if inner.paused {
                return None;
            }
            Self::pop_locked(&mut inner)
        };
        if popped.is_some() {
            self.space_notify.notify_one();
        }
        popped
    }

    /// Record an event discarded for expiry; counts as a finished task
    fn discard_expired(&self, event: &Event) {
        warn!(event_type = event.event_type.as_str(), "Skipping expired event");
        {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            inner.stats.total_expired += 1;
        }
        self.task_done();
    }

    /// Get the next event, waiting until one is available and the queue is
    /// not paused
    pub async fn get(&self, skip_expired: bool) -> Event {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(event) = self.try_pop() {
                if skip_expired && event.is_expired() {
                    self.discard_expired(&event);
                    continue;
                }
                // Hand the wakeup on if more work remains
                if !self.empty() {
                    self.notify.notify_one();
                }
                return event;
            }

            notified.await;
        }
    }

    /// Get the next event without waiting
    ///
    /// Does not consult the pause latch; only the blocking `get` is gated.
    pub fn get_nowait(&self, skip_expired: bool) -> Option<Event> {
        let popped = {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            Self::pop_locked(&mut inner)
        };
        if popped.is_some() {
            self.space_notify.notify_one();
        }
        match popped {
            Some(event) if skip_expired && event.is_expired() => {
                self.discard_expired(&event);
                None
            }
            other => other,
        }
    }

    /// Mark one dequeued event as fully processed
    pub fn task_done(&self) {
        let all_done = {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            inner.unfinished = inner.unfinished.saturating_sub(1);
            inner.unfinished == 0
        };
        if all_done {
            self.done_notify.notify_waiters();
        }
    }

    /// Wait until every enqueued event has been processed
    pub async fn join(&self) {
        loop {
            let notified = self.done_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.lock().expect("queue mutex poisoned").unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Pause dequeuing; `get` blocks until `resume`
    pub fn pause(&self) {
        self.inner.lock().expect("queue mutex poisoned").paused = true;
        info!("Event queue paused");
    }

    /// Resume dequeuing
    pub fn resume(&self) {
        self.inner.lock().expect("queue mutex poisoned").paused = false;
        info!("Event queue resumed");
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue is paused
    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("queue mutex poisoned").paused
    }

    /// Whether the queue holds no events
    pub fn empty(&self) -> bool {
        self.inner.lock().expect("queue mutex poisoned").heap.is_empty()
    }

    /// Number of queued events
    pub fn qsize(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").heap.len()
    }

    /// Drop all queued events, returning how many were removed
    ///
    /// Cleared events count as finished for `join` accounting.
    pub fn clear(&self) -> usize {
        let (count, all_done) = {
            let mut inner = self.inner.lock().expect("queue mutex poisoned");
            let count = inner.heap.len();
            inner.heap.clear();
            inner.unfinished = inner.unfinished.saturating_sub(count);
            (count, inner.unfinished == 0)
        };
        if all_done {
            self.done_notify.notify_waiters();
        }
        self.space_notify.notify_waiters();
        info!(count, "Cleared events from queue");
        count
    }

    /// Best-effort look at the next event without removing it
    pub fn peek(&self) -> Option<Event> {
        self.inner
            .lock()
            .expect("queue mutex poisoned")
            .heap
            .peek()
            .map(|qe| qe.event.clone())
    }

    /// Snapshot of the queue statistics
    pub fn get_statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        let mut stats = inner.stats.clone();
        stats.current_size = inner.heap.len();
        stats
    }
}

/// Event queue that collects events into a buffer and flushes them to the
/// main heap when the buffer fills or `buffer_timeout` elapses since the last
/// flush (checked at each put)
pub struct BufferedEventQueue {
    queue: EventQueue,
    buffer: Mutex<BufferState>,
    buffer_size: usize,
    buffer_timeout: f64,
}

struct BufferState {
    events: Vec<Event>,
    last_flush: chrono::DateTime<Utc>,
}

impl BufferedEventQueue {
    /// Create a buffered queue flushing at `buffer_size` events or
    /// `buffer_timeout` seconds
    pub fn new(buffer_size: usize, buffer_timeout: f64) -> Self {
        Self {
            queue: EventQueue::new(),
            buffer: Mutex::new(BufferState {
                events: Vec::new(),
                last_flush: Utc::now(),
            }),
            buffer_size,
            buffer_timeout,
        }
    }

    /// The underlying queue events are flushed into
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Buffer an event, flushing if the size or time threshold is reached
    pub async fn put_buffered(&self, event: Event) {
        let flushed = {
            let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
            buffer.events.push(event);
            let elapsed = (Utc::now() - buffer.last_flush).num_milliseconds() as f64 / 1000.0;
            if buffer.events.len() >= self.buffer_size || elapsed >= self.buffer_timeout {
                Some(Self::drain(&mut buffer))
            } else {
                None
            }
        };
        if let Some(events) = flushed {
            self.flush_events(events).await;
        }
    }

    /// Flush all buffered events to the main queue
    pub async fn flush(&self) {
        let events = {
            let mut buffer = self.buffer.lock().expect("buffer mutex poisoned");
            Self::drain(&mut buffer)
        };
        self.flush_events(events).await;
    }

    fn drain(buffer: &mut BufferState) -> Vec<Event> {
        buffer.last_flush = Utc::now();
        std::mem::take(&mut buffer.events)
    }

    async fn flush_events(&self, events: Vec<Event>) {
        let count = events.len();
        for event in events {
            self.queue.put(event).await;
        }
        if count > 0 {
            debug!(count, "Flushed events from buffer");
        }
    }

    /// Number of events currently buffered
    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().expect("buffer mutex poisoned").events.len()
    }
}

/// Event queue that boosts the priority of aging events on dequeue
///
/// Prevents starvation of low-priority events: an event that has waited
/// `n * boost_interval` seconds dequeues at `min(n, max_boost)` levels above
/// its original priority, clamped at [`EventPriority::Critical`].
pub struct PriorityBoostQueue {
    queue: EventQueue,
    boost_interval: f64,
    max_boost: u8,
}

impl PriorityBoostQueue {
    /// Create a boost queue with the given interval and maximum boost levels
    pub fn new(boost_interval: f64, max_boost: u8) -> Self {
        Self {
            queue: EventQueue::new(),
            boost_interval,
            max_boost,
        }
    }

    /// The underlying queue
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Add an event
    pub async fn put(&self, event: Event) {
        self.queue.put(event).await;
    }

    /// Get the next event, reflecting any priority boost it earned
    pub async fn get(&self, skip_expired: bool) -> Event {
        let mut event = self.queue.get(skip_expired).await;

        let age = (Utc::now() - event.created_at).num_milliseconds() as f64 / 1000.0;
        let boost_levels =
            ((age / self.boost_interval) as i64).clamp(0, self.max_boost as i64) as u8;

        if boost_levels > 0 {
            let new_value = event.priority.value().saturating_sub(boost_levels);
            let new_priority =
                EventPriority::from_value(new_value).unwrap_or(EventPriority::Critical);
            if new_priority != event.priority {
                debug!(
                    from = event.priority.name(),
                    to = new_priority.name(),
                    event_type = event.event_type.as_str(),
                    "Priority boost"
                );
                event.priority = new_priority;
            }
        }

        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{EventSource, EventType};
    use std::sync::Arc;
    use std::time::Duration;

    fn event(priority: EventPriority, event_type: EventType) -> Event {
        Event::new(event_type, priority, EventSource::Internal)
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = EventQueue::new();
        queue.put(event(EventPriority::Low, EventType::Custom)).await;
        queue.put(event(EventPriority::High, EventType::GoalDeadline)).await;
        queue.put(event(EventPriority::Background, EventType::HealthCheck)).await;
        queue.put(event(EventPriority::Normal, EventType::Message)).await;

        let order: Vec<EventPriority> = [
            queue.get(true).await,
            queue.get(true).await,
            queue.get(true).await,
            queue.get(true).await,
        ]
        .iter()
        .map(|e| e.priority)
        .collect();

        assert_eq!(
            order,
            vec![
                EventPriority::High,
                EventPriority::Normal,
                EventPriority::Low,
                EventPriority::Background,
            ]
        );
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = EventQueue::new();
        let first = event(EventPriority::Normal, EventType::Message);
        let second = event(EventPriority::Normal, EventType::Message);
        queue.put(first.clone()).await;
        queue.put(second.clone()).await;

        assert_eq!(queue.get(true).await, first);
        assert_eq!(queue.get(true).await, second);
    }

    #[tokio::test]
    async fn test_get_blocks_until_put() {
        let queue = Arc::new(EventQueue::new());
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get(true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!getter.is_finished());

        queue.put(event(EventPriority::Normal, EventType::Message)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event_type, EventType::Message);
    }

    #[tokio::test]
    async fn test_bounded_put_nowait_fails_when_full() {
        let queue = EventQueue::with_maxsize(1);
        queue
            .put_nowait(event(EventPriority::Normal, EventType::Message))
            .unwrap();

        let err = queue
            .put_nowait(event(EventPriority::Normal, EventType::Message))
            .unwrap_err();
        assert_eq!(err.0.event_type, EventType::Message);
        assert_eq!(queue.qsize(), 1);
    }

    #[tokio::test]
    async fn test_bounded_put_waits_for_space() {
        let queue = Arc::new(EventQueue::with_maxsize(1));
        queue.put(event(EventPriority::Normal, EventType::Message)).await;

        let putter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.put(event(EventPriority::Normal, EventType::Custom)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!putter.is_finished());

        let _ = queue.get(true).await;
        tokio::time::timeout(Duration::from_secs(1), putter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.qsize(), 1);
    }

    #[tokio::test]
    async fn test_pause_gates_get_until_resume() {
        let queue = Arc::new(EventQueue::new());
        queue.put(event(EventPriority::Normal, EventType::Message)).await;
        queue.pause();
        assert!(queue.is_paused());

        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get(true).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!getter.is_finished());

        queue.resume();
        let got = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event_type, EventType::Message);
        assert!(!queue.is_paused());
    }

    #[tokio::test]
    async fn test_expired_events_skipped_exactly_once() {
        let queue = EventQueue::new();
        let mut stale = event(EventPriority::Critical, EventType::GoalDeadline);
        stale.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        queue.put(stale).await;
        queue.put(event(EventPriority::Low, EventType::Custom)).await;

        let got = queue.get(true).await;
        assert_eq!(got.event_type, EventType::Custom);

        let stats = queue.get_statistics();
        assert_eq!(stats.total_expired, 1);
        assert_eq!(stats.total_enqueued, 2);
    }

    #[tokio::test]
    async fn test_get_nowait() {
        let queue = EventQueue::new();
        assert!(queue.get_nowait(true).is_none());

        queue
            .put_nowait(event(EventPriority::Normal, EventType::Message))
            .unwrap();
        assert!(queue.get_nowait(true).is_some());
        assert!(queue.get_nowait(true).is_none());
    }

    #[tokio::test]
    async fn test_join_waits_for_task_done() {
        let queue = Arc::new(EventQueue::new());
        queue.put(event(EventPriority::Normal, EventType::Message)).await;
        let _ = queue.get(true).await;

        let joiner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.join().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!joiner.is_finished());

        queue.task_done();
        tokio::time::timeout(Duration::from_secs(1), joiner)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_clear_and_peek() {
        let queue = EventQueue::new();
        queue.put(event(EventPriority::Low, EventType::Custom)).await;
        queue.put(event(EventPriority::High, EventType::GoalDeadline)).await;

        let top = queue.peek().unwrap();
        assert_eq!(top.priority, EventPriority::High);
        assert_eq!(queue.qsize(), 2);

        assert_eq!(queue.clear(), 2);
        assert!(queue.empty());
        // Cleared events count as finished
        queue.join().await;
    }

    #[tokio::test]
    async fn test_statistics_by_priority_and_type() {
        let queue = EventQueue::new();
        queue.put(event(EventPriority::Normal, EventType::Message)).await;
        queue.put(event(EventPriority::Normal, EventType::Message)).await;
        queue.put(event(EventPriority::High, EventType::GoalDeadline)).await;
        let _ = queue.get(true).await;

        let stats = queue.get_statistics();
        assert_eq!(stats.total_enqueued, 3);
        assert_eq!(stats.total_dequeued, 1);
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.by_priority["normal"], 2);
        assert_eq!(stats.by_type["message"], 2);
        assert_eq!(stats.by_type["goal_deadline"], 1);
    }

    #[tokio::test]
    async fn test_buffered_flush_on_size() {
        let buffered = BufferedEventQueue::new(3, 60.0);
        buffered.put_buffered(event(EventPriority::Normal, EventType::Message)).await;
        buffered.put_buffered(event(EventPriority::Normal, EventType::Message)).await;
        assert_eq!(buffered.buffer_len(), 2);
        assert_eq!(buffered.queue().qsize(), 0);

        buffered.put_buffered(event(EventPriority::Normal, EventType::Message)).await;
        assert_eq!(buffered.buffer_len(), 0);
        assert_eq!(buffered.queue().qsize(), 3);
    }

    #[tokio::test]
    async fn test_buffered_manual_flush() {
        let buffered = BufferedEventQueue::new(100, 3600.0);
        buffered.put_buffered(event(EventPriority::Normal, EventType::Message)).await;
        buffered.flush().await;
        assert_eq!(buffered.buffer_len(), 0);
        assert_eq!(buffered.queue().qsize(), 1);
    }

    #[tokio::test]
    async fn test_boost_queue_promotes_aged_events() {
        let boost = PriorityBoostQueue::new(0.05, 2);
        let mut old = event(EventPriority::Background, EventType::HealthCheck);
        old.created_at = Utc::now() - chrono::Duration::seconds(10);
        boost.put(old).await;

        let got = boost.get(true).await;
        // Aged two intervals or more, boosted by max_boost levels
        assert_eq!(got.priority, EventPriority::Normal);
    }

    #[tokio::test]
    async fn test_boost_clamps_at_critical() {
        let boost = PriorityBoostQueue::new(0.01, 10);
        let mut old = event(EventPriority::High, EventType::GoalDeadline);
        old.created_at = Utc::now() - chrono::Duration::seconds(60);
        boost.put(old).await;

        let got = boost.get(true).await;
        assert_eq!(got.priority, EventPriority::Critical);
    }

    #[tokio::test]
    async fn test_boost_leaves_fresh_events_alone() {
        let boost = PriorityBoostQueue::new(60.0, 2);
        boost.put(event(EventPriority::Low, EventType::Custom)).await;
        let got = boost.get(true).await;
        assert_eq!(got.priority, EventPriority::Low);
    }
}
