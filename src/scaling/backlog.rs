//! Backlog source — per-cycle read of the endpoint's queued-request metric

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::ScalingPolicy;
use crate::error::{DispatchError, Result};
use crate::scaling::executor::ScalingTarget;

/// One aggregated backlog reading. Queried fresh every cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklogSample {
    pub metric_name: String,
    /// Backlog per instance, aggregated with the policy's statistic
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Reads the backlog metric for a scaling target
#[async_trait]
pub trait BacklogSource: Send + Sync {
    /// Latest aggregated sample over one evaluation period.
    ///
    /// `Ok(None)` means the metric had no datapoints in the window.
    async fn latest(
        &self,
        policy: &ScalingPolicy,
        target: &ScalingTarget,
    ) -> Result<Option<BacklogSample>>;

    /// Source name (for logging)
    fn name(&self) -> &str;
}

/// One scripted reading
#[derive(Debug, Clone)]
enum Step {
    /// Raw datapoints of one period, aggregated with the policy's statistic
    Datapoints(Vec<f64>),
    Missing,
    Error(String),
}

/// Backlog source that replays queued readings, then repeats the last one.
/// Used by tests and dry runs.
pub struct ScriptedBacklogSource {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
}

impl ScriptedBacklogSource {
    /// Create a source whose readings default to "no datapoints"
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            last: Mutex::new(Step::Missing),
        }
    }

    /// Queue a period with a single datapoint
    pub fn push_value(&self, value: f64) {
        self.push_datapoints(vec![value]);
    }

    /// Queue a period with several raw datapoints
    pub fn push_datapoints(&self, values: Vec<f64>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step::Datapoints(values));
    }

    pub fn push_missing(&self) {
        self.steps.lock().unwrap().push_back(Step::Missing);
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step::Error(message.into()));
    }
}

impl Default for ScriptedBacklogSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BacklogSource for ScriptedBacklogSource {
    async fn latest(
        &self,
        policy: &ScalingPolicy,
        _target: &ScalingTarget,
    ) -> Result<Option<BacklogSample>> {
        let step = match self.steps.lock().unwrap().pop_front() {
            Some(step) => {
                *self.last.lock().unwrap() = step.clone();
                step
            }
            None => self.last.lock().unwrap().clone(),
        };

        match step {
            Step::Datapoints(values) => Ok(policy.statistic.aggregate(&values).map(|value| {
                BacklogSample {
                    metric_name: policy.metric_name.clone(),
                    value,
                    timestamp: Utc::now(),
                }
            })),
            Step::Missing => Ok(None),
            Step::Error(message) => Err(DispatchError::Metrics(message)),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
