//! Event model, priority queue, and dispatch pipeline

mod processor;
mod queue;
mod types;

pub use processor::{
    BatchEventProcessor, EventHandler, EventProcessor, HandlerError, HandlerOutput, Middleware,
    ProcessingResult, ProcessorStatistics, handler_fn, middleware_fn,
};
pub use queue::{BufferedEventQueue, EventQueue, PriorityBoostQueue, QueueFull, QueueStatistics};
pub use types::{Event, EventPriority, EventSource, EventType};
