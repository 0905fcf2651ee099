//! Capacity executor — trait and implementations for applying scaling decisions
//!
//! Provides the `CapacityExecutor` async trait with:
//! - `MockCapacityExecutor` — records decisions in memory (tests and dry runs)
//! - `SageMakerCapacityExecutor` — updates the endpoint variant's desired
//!   instance count (feature-gated behind `aws`, see `backend::aws`)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{DispatchError, Result};

/// The endpoint variant whose instance count is controlled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScalingTarget {
    pub endpoint: String,
    pub variant: String,
}

impl ScalingTarget {
    pub fn new(endpoint: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            variant: variant.into(),
        }
    }

    /// Scalable resource id, e.g. `endpoint/WhisperEndpoint/variant/WhisperVariant`
    pub fn resource_id(&self) -> String {
        format!("endpoint/{}/variant/{}", self.endpoint, self.variant)
    }
}

impl std::fmt::Display for ScalingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resource_id())
    }
}

/// Direction of a scaling operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Out,
    In,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Out => write!(f, "out"),
            Self::In => write!(f, "in"),
        }
    }
}

/// A scaling decision emitted by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleDecision {
    /// Variant being scaled
    pub target: ScalingTarget,
    /// Direction of scaling
    pub direction: ScaleDirection,
    /// Capacity the controller last committed
    pub current_capacity: u32,
    /// Capacity to apply
    pub desired_capacity: u32,
    /// Backlog sample that triggered the decision
    pub backlog: f64,
    /// Human-readable reason for the decision
    pub reason: String,
}

/// Result of executing a scaling decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResult {
    /// Whether the executor accepted the decision
    pub accepted: bool,
    /// Capacity after execution
    pub actual_capacity: u32,
    /// Optional message from the executor
    pub message: String,
}

/// Async trait for applying scaling decisions to the inference endpoint
#[async_trait]
pub trait CapacityExecutor: Send + Sync {
    /// Execute a scaling decision
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult>;

    /// Query the current instance count of a variant
    async fn current_capacity(&self, target: &ScalingTarget) -> Result<u32>;

    /// Executor name (for logging)
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// MockCapacityExecutor
// ---------------------------------------------------------------------------

/// Mock capacity executor that records decisions in memory
pub struct MockCapacityExecutor {
    /// Recorded decisions
    decisions: Arc<Mutex<Vec<ScaleDecision>>>,
    /// Simulated instance count per variant
    capacity: Arc<Mutex<std::collections::HashMap<ScalingTarget, u32>>>,
    failing: AtomicBool,
}

impl MockCapacityExecutor {
    /// Create a new mock executor
    pub fn new() -> Self {
        Self {
            decisions: Arc::new(Mutex::new(Vec::new())),
            capacity: Arc::new(Mutex::new(std::collections::HashMap::new())),
            failing: AtomicBool::new(false),
        }
    }

    /// Get all recorded decisions
    pub fn decisions(&self) -> Vec<ScaleDecision> {
        self.decisions.lock().unwrap().clone()
    }

    /// Set the simulated instance count for a variant
    pub fn set_capacity(&self, target: &ScalingTarget, count: u32) {
        self.capacity.lock().unwrap().insert(target.clone(), count);
    }

    /// Make every call fail, as an unavailable capacity API would
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Scaling(
                "Mock: capacity API unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MockCapacityExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapacityExecutor for MockCapacityExecutor {
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        self.check_available()?;
        self.decisions.lock().unwrap().push(decision.clone());
        self.capacity
            .lock()
            .unwrap()
            .insert(decision.target.clone(), decision.desired_capacity);

        Ok(ScaleResult {
            accepted: true,
            actual_capacity: decision.desired_capacity,
            message: format!(
                "Mock: scaled '{}' to {} instances",
                decision.target, decision.desired_capacity
            ),
        })
    }

    async fn current_capacity(&self, target: &ScalingTarget) -> Result<u32> {
        self.check_available()?;
        Ok(*self.capacity.lock().unwrap().get(target).unwrap_or(&0))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ScalingTarget {
        ScalingTarget::new("WhisperEndpoint", "WhisperVariant")
    }

    fn decision(desired: u32) -> ScaleDecision {
        ScaleDecision {
            target: target(),
            direction: ScaleDirection::Out,
            current_capacity: 0,
            desired_capacity: desired,
            backlog: 1.0,
            reason: "test".into(),
        }
    }

    #[test]
    fn test_resource_id() {
        assert_eq!(
            target().resource_id(),
            "endpoint/WhisperEndpoint/variant/WhisperVariant"
        );
        assert_eq!(target().to_string(), target().resource_id());
    }

    #[test]
    fn test_scale_direction_display() {
        assert_eq!(ScaleDirection::Out.to_string(), "out");
        assert_eq!(ScaleDirection::In.to_string(), "in");
    }

    #[test]
    fn test_scale_decision_serialization() {
        let json = serde_json::to_string(&decision(1)).unwrap();
        let parsed: ScaleDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, decision(1));
        assert!(json.contains("\"direction\":\"out\""));
    }

    #[tokio::test]
    async fn test_mock_records_decisions() {
        let mock = MockCapacityExecutor::new();
        let result = mock.execute(&decision(1)).await.unwrap();
        assert!(result.accepted);
        assert_eq!(result.actual_capacity, 1);
        assert_eq!(mock.decisions().len(), 1);
        assert_eq!(mock.current_capacity(&target()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mock_returns_capacity() {
        let mock = MockCapacityExecutor::new();
        assert_eq!(mock.current_capacity(&target()).await.unwrap(), 0);
        mock.set_capacity(&target(), 1);
        assert_eq!(mock.current_capacity(&target()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mock_failing() {
        let mock = MockCapacityExecutor::new();
        mock.set_failing(true);
        assert!(mock.execute(&decision(1)).await.is_err());
        assert!(mock.current_capacity(&target()).await.is_err());
        assert!(mock.decisions().is_empty());
    }

    #[test]
    fn test_executor_trait_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<MockCapacityExecutor>();
        assert_send_sync::<dyn CapacityExecutor>();
    }
}
