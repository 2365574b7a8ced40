//! Scaling module — replica-count control and generation replacement
//!
//! Provides the metric-driven autoscaling controller, the scale executor
//! that applies its decisions to a placement, and the rollout controller
//! that replaces one generation with the next under a healthy-replica floor.

pub mod autoscaler;
pub mod executor;
pub mod rollout;

pub use autoscaler::{AutoscalingController, ScaleTarget};
pub use executor::{ComputeScaleExecutor, ScaleDecision, ScaleDirection, ScaleExecutor};
pub use rollout::{
    Generation, RolloutController, RolloutReport, RolloutRequest, RolloutState, Transition,
};
