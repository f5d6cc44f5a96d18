//! Metacognition - the agent's self-awareness layer
//!
//! Loop detection, failure prediction, confidence estimation, and the
//! monitor that combines them into per-action interventions.

mod confidence;
mod failure_predictor;
mod handoff;
mod intervention;
mod loop_detector;
mod monitor;

pub use confidence::{
    ConfidenceEstimate, ConfidenceEstimator, ConfidenceFactor, ConfidenceInputs,
};
pub use failure_predictor::{
    FailurePrediction, FailurePredictor, FailurePredictorStats, FailureReason,
};
pub use handoff::{
    ChannelHandler, HandoffChannel, HandoffStats, HumanHandoff, HumanRequest, HumanResponse,
    RequestUrgency,
};
pub use intervention::{Intervention, InterventionType};
pub use loop_detector::{LoopDetector, LoopDetectorStats, LoopPattern, LoopType};
pub use monitor::{MetacognitiveMonitor, MonitorInputs, MonitorStats, MonitoringState};
