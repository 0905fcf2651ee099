//! Scaling policy — backlog target tracking with asymmetric cooldowns

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Aggregation applied to the backlog metric over one evaluation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    /// Arithmetic mean of the datapoints (default)
    #[default]
    Avg,
    /// Largest datapoint
    Max,
    /// Smallest datapoint
    Min,
    /// Sum of the datapoints
    Sum,
}

impl Statistic {
    /// Aggregate raw datapoints; `None` when there are none
    pub fn aggregate(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let value = match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Self::Min => values.iter().copied().fold(f64::MAX, f64::min),
            Self::Sum => values.iter().sum(),
        };
        Some(value)
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Avg => write!(f, "avg"),
            Self::Max => write!(f, "max"),
            Self::Min => write!(f, "min"),
            Self::Sum => write!(f, "sum"),
        }
    }
}

/// Scaling policy for the inference endpoint variant
///
/// The defaults describe a single-instance deployment that scales to zero:
///
/// ```hcl
/// scaling {
///   min_capacity            = 0
///   max_capacity            = 1
///   target_value            = 0.99
///   scale_in_cooldown_secs  = 300
///   scale_out_cooldown_secs = 0
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    /// Whether the controller loop runs at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower capacity bound (default: 0, enables scale-to-zero)
    #[serde(default)]
    pub min_capacity: u32,

    /// Upper capacity bound (default: 1)
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    /// Backlog per instance the controller tracks (default: 0.99)
    #[serde(default = "default_target_value")]
    pub target_value: f64,

    /// Quiescence window before capacity may be reduced (default: 300)
    #[serde(default = "default_scale_in_cooldown")]
    pub scale_in_cooldown_secs: u64,

    /// Minimum gap between two scale-outs (default: 0)
    #[serde(default)]
    pub scale_out_cooldown_secs: u64,

    /// Seconds between evaluation cycles, also the metric period (default: 60)
    #[serde(default = "default_evaluation_period")]
    pub evaluation_period_secs: u64,

    /// Metric aggregation (default: avg)
    #[serde(default)]
    pub statistic: Statistic,

    /// Backlog metric name
    #[serde(default = "default_metric_name")]
    pub metric_name: String,

    /// Backlog metric namespace
    #[serde(default = "default_metric_namespace")]
    pub metric_namespace: String,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_capacity: 0,
            max_capacity: default_max_capacity(),
            target_value: default_target_value(),
            scale_in_cooldown_secs: default_scale_in_cooldown(),
            scale_out_cooldown_secs: 0,
            evaluation_period_secs: default_evaluation_period(),
            statistic: Statistic::default(),
            metric_name: default_metric_name(),
            metric_namespace: default_metric_namespace(),
        }
    }
}

impl ScalingPolicy {
    pub fn scale_in_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_in_cooldown_secs)
    }

    pub fn scale_out_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_out_cooldown_secs)
    }

    pub fn evaluation_period(&self) -> Duration {
        Duration::from_secs(self.evaluation_period_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_capacity() -> u32 {
    1
}

fn default_target_value() -> f64 {
    0.99
}

fn default_scale_in_cooldown() -> u64 {
    300
}

fn default_evaluation_period() -> u64 {
    60
}

fn default_metric_name() -> String {
    "ApproximateBacklogSizePerInstance".to_string()
}

fn default_metric_namespace() -> String {
    "AWS/SageMaker".to_string()
}

/// Validate a scaling policy
pub fn validate_scaling(policy: &ScalingPolicy) -> Result<()> {
    if policy.min_capacity > policy.max_capacity {
        return Err(DispatchError::Config(format!(
            "Scaling: min_capacity ({}) must be <= max_capacity ({})",
            policy.min_capacity, policy.max_capacity
        )));
    }
    if policy.max_capacity == 0 {
        return Err(DispatchError::Config(
            "Scaling: max_capacity must be at least 1".to_string(),
        ));
    }
    if !policy.target_value.is_finite() || policy.target_value <= 0.0 {
        return Err(DispatchError::Config(format!(
            "Scaling: target_value ({}) must be a positive number",
            policy.target_value
        )));
    }
    if policy.evaluation_period_secs == 0 {
        return Err(DispatchError::Config(
            "Scaling: evaluation_period_secs must be greater than 0".to_string(),
        ));
    }
    if policy.metric_name.trim().is_empty() {
        return Err(DispatchError::Config(
            "Scaling: metric_name must not be empty".to_string(),
        ));
    }
    Ok(())
}
