//! Scaling module — backlog-driven capacity control for the inference endpoint
//!
//! Provides the periodic scaling controller, the backlog metric source, and
//! pluggable capacity executors.

pub mod backlog;
pub mod controller;
pub mod executor;

pub use backlog::{BacklogSample, BacklogSource, ScriptedBacklogSource};
pub use controller::{compute_desired_capacity, ScalingController, ScalingState, TickOutcome};
pub use executor::{
    CapacityExecutor, MockCapacityExecutor, ScaleDecision, ScaleDirection, ScaleResult,
    ScalingTarget,
};
