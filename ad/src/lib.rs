//! AgentDaemon - autonomous agent runtime
//!
//! A long-running supervisor that drives a cognitive loop (plan -> act ->
//! learn) while exposing monitoring and control to external clients. The
//! system runs as two cooperating processes - a controller and a worker -
//! connected by the file-backed state and command plane in the `statestore`
//! crate.
//!
//! # Modules
//!
//! - [`events`] - typed events, priority queue, and dispatch pipeline
//! - [`scheduler`] - one-shot and recurring tasks with an optimal-hour learner
//! - [`runtime`] - lifecycle composition: listeners, supervisor, main loop
//! - [`learning`] - action tracking, self-critique, lessons, strategy biases
//! - [`metacognition`] - loop detection, failure prediction, interventions
//! - [`worker`] - the worker process loop and its collaborator seams
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod events;
pub mod learning;
pub mod metacognition;
pub mod runtime;
pub mod scheduler;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use daemon::{DaemonManager, DaemonStatus};
pub use events::{
    BatchEventProcessor, BufferedEventQueue, Event, EventHandler, EventPriority, EventProcessor,
    EventQueue, EventSource, EventType, HandlerError, Middleware, PriorityBoostQueue,
    ProcessingResult, handler_fn, middleware_fn,
};
pub use learning::{
    ActionBias, ActionOutcome, ActionStats, ActionTracker, AdaptiveLearningModule, Critique,
    FailedAction, ImprovementSuggestion, Lesson, LessonRepository, SelfCritic, StrategyAdapter,
};
pub use metacognition::{
    ConfidenceEstimate, ConfidenceEstimator, FailurePrediction, FailurePredictor, HumanHandoff,
    Intervention, InterventionType, LoopDetector, MetacognitiveMonitor, MonitorInputs,
};
pub use runtime::{
    AutonomousRuntime, BackgroundProcessManager, CallbackListener, EventListener, RuntimeConfig,
    RuntimeState, WebhookListener,
};
pub use scheduler::{PatternLearner, Recurrence, ScheduledTask, Scheduler, TaskOptions, When};
pub use worker::{
    ActionExecutor, AgentRunner, ExecutionOutcome, PlannedAction, Planner, ScriptedExecutor,
    ScriptedPlanner, WorkerConfig,
};
